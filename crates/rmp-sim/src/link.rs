use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rmp_core::{Clock, ManualClock, MessageId, MessageType};
use rmp_messaging::{
    ConfigError, ContextId, InboundMessage, ManagerConfig, RecordingDelegate, ReliableError,
    ReliableManager,
};
use rmp_transport::{HeapBufferProvider, InMemoryExchange, ManualTimer, SendFlags, SentMessage};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::scenarios::LossScenario;

const REQUEST_TYPE: MessageType = MessageType(1);
const REPLY_TYPE: MessageType = MessageType(2);
const REPLY_ID_BASE: u32 = 0x8000_0000;
const MAX_STEPS_PER_MESSAGE: usize = 1_000;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Reliable(#[from] ReliableError),
    #[error("loss rate {0}% exceeds 100%")]
    InvalidLossRate(u8),
    #[error("simulation stalled after {steps} steps")]
    Stalled { steps: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimReport {
    pub messages: usize,
    /// Distinct requests that reached the receiver.
    pub delivered: usize,
    pub acked: usize,
    pub exhausted: usize,
    pub retransmissions: usize,
    pub standalone_acks: usize,
    pub piggybacked_acks: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub elapsed_ms: u64,
}

impl SimReport {
    /// Every request reached exactly one terminal outcome.
    pub fn is_settled(&self) -> bool {
        self.acked + self.exhausted == self.messages
    }
}

enum Delivery {
    Fresh(MessageId),
    Duplicate,
    Ack,
}

struct Endpoint {
    manager: ReliableManager<InMemoryExchange>,
    timer: ManualTimer,
    exchange: InMemoryExchange,
    delegate: RecordingDelegate,
    context: ContextId,
    seen: BTreeSet<MessageId>,
}

impl Endpoint {
    fn new(config: &ManagerConfig, clock: &ManualClock) -> Result<Self, SimError> {
        let timer = ManualTimer::default();
        let mut manager = ReliableManager::new(
            config.clone(),
            Box::new(clock.clone()),
            Box::new(timer.clone()),
            Box::new(HeapBufferProvider::unlimited()),
        )?;
        let exchange = InMemoryExchange::default();
        let delegate = RecordingDelegate::default();
        let context = manager.register_context(exchange.clone(), None);
        manager
            .context_ops(context)?
            .context_mut()?
            .set_delegate(Some(Box::new(delegate.clone())));
        Ok(Self {
            manager,
            timer,
            exchange,
            delegate,
            context,
            seen: BTreeSet::new(),
        })
    }

    fn send(&mut self, message_id: MessageId, message_type: MessageType) -> Result<(), ReliableError> {
        self.manager
            .context_ops(self.context)?
            .send_message(message_id, message_type, Bytes::from_static(b"sim-payload"))
            .map(|_| ())
    }

    fn receive(&mut self, message: SentMessage) -> Result<Delivery, ReliableError> {
        let mut ops = self.manager.context_ops(self.context)?;
        if message.message_type.is_standalone_ack() {
            if let Some(ack_id) = message.options.ack_id {
                match ops.handle_received_ack(ack_id) {
                    Ok(()) | Err(ReliableError::InvalidAckId(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            return Ok(Delivery::Ack);
        }

        let Some(message_id) = message.options.message_id else {
            return Ok(Delivery::Ack);
        };
        let is_duplicate = !self.seen.insert(message_id);
        ops.handle_inbound(InboundMessage {
            message_id,
            needs_ack: message.options.flags.contains(SendFlags::REQUEST_ACK),
            is_duplicate,
            piggyback_ack: message.options.ack_id,
        })?;
        Ok(if is_duplicate {
            Delivery::Duplicate
        } else {
            Delivery::Fresh(message_id)
        })
    }

    fn is_idle(&self) -> bool {
        self.manager.retrans_table_len() == 0 && self.timer.armed().is_none()
    }
}

/// Two endpoints joined by a seeded lossy link.
///
/// Endpoint A sends ack-requested requests. Endpoint B answers every second
/// fresh request with an unacked reply that carries the pending ack, and
/// leaves the rest to standalone acks.
pub struct LinkSimulation {
    clock: ManualClock,
    a: Endpoint,
    b: Endpoint,
    rng: StdRng,
    scenario: LossScenario,
    report: SimReport,
}

impl LinkSimulation {
    pub fn new(config: &ManagerConfig, scenario: LossScenario) -> Result<Self, SimError> {
        if scenario.loss_rate_percent > 100 {
            return Err(SimError::InvalidLossRate(scenario.loss_rate_percent));
        }
        config.validate()?;
        let clock = ManualClock::default();
        let a = Endpoint::new(config, &clock)?;
        let mut b = Endpoint::new(config, &clock)?;
        b.manager
            .context_ops(b.context)?
            .context_mut()?
            .set_auto_request_ack(false);
        Ok(Self {
            clock,
            a,
            b,
            rng: StdRng::seed_from_u64(scenario.seed),
            scenario,
            report: SimReport::default(),
        })
    }

    /// Sends `messages` requests from A to B and runs until every request is
    /// acked or exhausted and both sides are idle.
    pub fn run(mut self, messages: usize) -> Result<SimReport, SimError> {
        self.report.messages = messages;
        let max_steps = messages.max(1).saturating_mul(MAX_STEPS_PER_MESSAGE);
        let mut next = 0usize;

        for _ in 0..max_steps {
            while next < messages {
                let message_id = MessageId(u32::try_from(next).unwrap_or(u32::MAX - 1) + 1);
                match self.a.send(message_id, REQUEST_TYPE) {
                    Ok(()) => next += 1,
                    Err(ReliableError::TableFull { .. }) => break,
                    Err(err) => return Err(err.into()),
                }
            }
            self.route()?;

            if next == messages && self.a.is_idle() && self.b.is_idle() {
                return Ok(self.finish());
            }
            self.advance_to_next_wakeup();
        }
        Err(SimError::Stalled { steps: max_steps })
    }

    fn lost(&mut self) -> bool {
        self.rng.gen_range(0..100u8) < self.scenario.loss_rate_percent
    }

    /// Moves traffic in both directions until neither side has anything
    /// queued.
    fn route(&mut self) -> Result<(), SimError> {
        loop {
            let from_a = self.a.exchange.take_outbound();
            let from_b = self.b.exchange.take_outbound();
            if from_a.is_empty() && from_b.is_empty() {
                return Ok(());
            }

            for message in from_a {
                if message.options.flags.contains(SendFlags::RETRANSMISSION) {
                    self.report.retransmissions += 1;
                }
                if self.lost() {
                    debug!(message_id = ?message.options.message_id, "dropped a->b");
                    self.report.dropped += 1;
                    continue;
                }
                match self.b.receive(message)? {
                    Delivery::Fresh(message_id) => {
                        self.report.delivered += 1;
                        if message_id.0 % 2 == 0 {
                            self.b
                                .send(MessageId(REPLY_ID_BASE | message_id.0), REPLY_TYPE)?;
                        }
                    }
                    Delivery::Duplicate => self.report.duplicates += 1,
                    Delivery::Ack => {}
                }
            }

            for message in from_b {
                if message.message_type.is_standalone_ack() {
                    self.report.standalone_acks += 1;
                } else if message.options.ack_id.is_some() {
                    self.report.piggybacked_acks += 1;
                }
                if self.lost() {
                    debug!(ack_id = ?message.options.ack_id, "dropped b->a");
                    self.report.dropped += 1;
                    continue;
                }
                self.a.receive(message)?;
            }
        }
    }

    /// Advances the shared clock to the earliest armed expiry and fires both
    /// timers.
    fn advance_to_next_wakeup(&mut self) {
        let wakeup = match (self.a.timer.armed(), self.b.timer.armed()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.clock.advance(wakeup.unwrap_or(Duration::ZERO));
        self.a.manager.handle_timer_fired();
        self.b.manager.handle_timer_fired();
    }

    fn finish(mut self) -> SimReport {
        self.report.acked = self.a.delegate.ack_count();
        self.report.exhausted = self.a.delegate.exhausted_count();
        self.report.elapsed_ms = self.clock.now_ms();
        info!(
            messages = self.report.messages,
            delivered = self.report.delivered,
            acked = self.report.acked,
            exhausted = self.report.exhausted,
            retransmissions = self.report.retransmissions,
            dropped = self.report.dropped,
            "simulation finished"
        );
        self.report
    }
}
