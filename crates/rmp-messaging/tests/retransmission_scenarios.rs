use std::time::Duration;

use bytes::Bytes;
use rmp_core::{ManualClock, MessageId, MessageType};
use rmp_messaging::{
    ContextId, DelegateEvent, ManagerConfig, ProtocolConfig, RecordingDelegate, ReliableError,
    ReliableManager,
};
use rmp_transport::{HeapBufferProvider, InMemoryExchange, ManualTimer};

struct Endpoint {
    manager: ReliableManager<InMemoryExchange>,
    clock: ManualClock,
    timer: ManualTimer,
    exchange: InMemoryExchange,
    delegate: RecordingDelegate,
    id: ContextId,
}

fn endpoint(protocol: ProtocolConfig) -> Endpoint {
    let clock = ManualClock::default();
    let timer = ManualTimer::default();
    let config = ManagerConfig {
        protocol,
        ..ManagerConfig::default()
    };
    let mut manager = ReliableManager::new(
        config,
        Box::new(clock.clone()),
        Box::new(timer.clone()),
        Box::new(HeapBufferProvider::unlimited()),
    )
    .expect("config should be valid");
    let exchange = InMemoryExchange::default();
    let delegate = RecordingDelegate::default();
    let id = manager.register_context(exchange.clone(), None);
    manager
        .context_mut(id)
        .expect("context registered")
        .set_delegate(Some(Box::new(delegate.clone())));
    Endpoint {
        manager,
        clock,
        timer,
        exchange,
        delegate,
        id,
    }
}

/// Advances the clock to the armed expiry and runs the timer callback.
fn fire_timer(ep: &mut Endpoint) -> bool {
    let Some(delay) = ep.timer.armed() else {
        return false;
    };
    ep.clock.advance(delay);
    ep.manager.handle_timer_fired();
    true
}

#[test]
fn unacked_message_is_reported_exhausted_exactly_once() {
    let mut ep = endpoint(ProtocolConfig {
        initial_retransmit_ticks: 5,
        active_retransmit_ticks: 5,
        ack_piggyback_ticks: 1,
        max_retransmissions: 2,
    });
    ep.manager
        .context_ops(ep.id)
        .expect("context registered")
        .send_message(MessageId(100), MessageType(1), Bytes::from_static(b"ping"))
        .expect("send should succeed");
    assert_eq!(ep.manager.retrans_table_len(), 1);

    assert!(fire_timer(&mut ep));
    assert_eq!(ep.manager.current_tick(), 5);
    assert!(fire_timer(&mut ep));
    assert_eq!(ep.manager.current_tick(), 10);
    assert!(!fire_timer(&mut ep));

    assert_eq!(
        ep.delegate.events(),
        vec![DelegateEvent::RetransmissionExhausted(
            MessageId(100),
            ReliableError::RetryExhausted(MessageId(100))
        )]
    );
    assert_eq!(ep.manager.retrans_table_len(), 0);
    assert_eq!(ep.exchange.stats().send_ok, 2);
    assert_eq!(ep.exchange.ref_count(), 0);
}

#[test]
fn late_ack_after_exhaustion_is_invalid() {
    let mut ep = endpoint(ProtocolConfig {
        max_retransmissions: 1,
        ..ProtocolConfig::default()
    });
    ep.manager
        .context_ops(ep.id)
        .expect("context registered")
        .send_message(MessageId(1), MessageType(1), Bytes::from_static(b"x"))
        .expect("send should succeed");
    while fire_timer(&mut ep) {}

    let err = ep
        .manager
        .context_ops(ep.id)
        .expect("context registered")
        .handle_received_ack(MessageId(1))
        .expect_err("exhausted entry no longer tracked");
    assert_eq!(err, ReliableError::InvalidAckId(MessageId(1)));
    assert_eq!(ep.delegate.exhausted_count(), 1);
    assert_eq!(ep.delegate.ack_count(), 0);
}

#[test]
fn piggyback_window_expiry_sends_standalone_ack() {
    let mut ep = endpoint(ProtocolConfig {
        ack_piggyback_ticks: 4,
        ..ProtocolConfig::default()
    });
    ep.manager
        .context_ops(ep.id)
        .expect("context registered")
        .handle_needs_ack(MessageId(7), false)
        .expect("needs-ack should succeed");
    assert_eq!(ep.timer.armed(), Some(Duration::from_millis(4 * 64)));

    ep.clock.advance(Duration::from_millis(3 * 64));
    ep.manager.handle_timer_fired();
    assert_eq!(ep.exchange.outbound_len(), 0);

    assert!(fire_timer(&mut ep));
    let sent = ep.exchange.take_outbound();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].options.ack_id, Some(MessageId(7)));
    assert!(ep.timer.armed().is_none());
}

#[test]
fn contexts_share_one_table_but_match_acks_by_identity() {
    let mut ep = endpoint(ProtocolConfig::default());
    let other_exchange = InMemoryExchange::default();
    let other = ep.manager.register_context(other_exchange.clone(), None);

    ep.manager
        .context_ops(ep.id)
        .expect("context registered")
        .send_message(MessageId(10), MessageType(1), Bytes::from_static(b"a"))
        .expect("send should succeed");
    ep.manager
        .context_ops(other)
        .expect("context registered")
        .send_message(MessageId(11), MessageType(1), Bytes::from_static(b"b"))
        .expect("send should succeed");
    assert_eq!(ep.manager.retrans_table_len(), 2);

    let err = ep
        .manager
        .context_ops(other)
        .expect("context registered")
        .handle_received_ack(MessageId(10))
        .expect_err("ack belongs to another context");
    assert_eq!(err, ReliableError::InvalidAckId(MessageId(10)));

    let removed = ep.manager.remove_context(other).expect("exchange returned");
    assert_eq!(removed.ref_count(), 0);
    assert_eq!(ep.manager.retrans_table_len(), 1);
    assert_eq!(ep.exchange.ref_count(), 1);
}

#[test]
fn sends_beyond_table_capacity_apply_backpressure() {
    let clock = ManualClock::default();
    let config = ManagerConfig {
        retrans_table_size: 2,
        ..ManagerConfig::default()
    };
    let mut manager = ReliableManager::new(
        config,
        Box::new(clock),
        Box::new(ManualTimer::default()),
        Box::new(HeapBufferProvider::unlimited()),
    )
    .expect("config should be valid");
    let exchange = InMemoryExchange::default();
    let id = manager.register_context(exchange.clone(), None);
    let mut ops = manager.context_ops(id).expect("context registered");

    for raw in 0..2 {
        ops.send_message(MessageId(raw), MessageType(1), Bytes::from_static(b"m"))
            .expect("room in table");
    }
    let err = ops
        .send_message(MessageId(2), MessageType(1), Bytes::from_static(b"m"))
        .expect_err("third send should be rejected");
    assert_eq!(err, ReliableError::TableFull { capacity: 2 });
    assert_eq!(exchange.stats().send_ok, 2);
}

#[test]
fn toml_config_drives_manager_timing() {
    let config = ManagerConfig::from_toml_str(
        r#"
        timer_tick = "100ms"

        [protocol]
        initial_retransmit_ticks = 2
        "#,
    )
    .expect("config should parse");
    let clock = ManualClock::default();
    let timer = ManualTimer::default();
    let mut manager = ReliableManager::new(
        config,
        Box::new(clock),
        Box::new(timer.clone()),
        Box::new(HeapBufferProvider::unlimited()),
    )
    .expect("config should be valid");
    let id = manager.register_context(InMemoryExchange::default(), None);
    manager
        .context_ops(id)
        .expect("context registered")
        .send_message(MessageId(1), MessageType(1), Bytes::from_static(b"m"))
        .expect("send should succeed");

    assert_eq!(timer.armed(), Some(Duration::from_millis(200)));
    assert_eq!(manager.ticks_to_duration(2), Duration::from_millis(200));
}
