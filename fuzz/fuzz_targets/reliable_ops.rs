#![no_main]

use std::time::Duration;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use rmp_core::{ManualClock, MessageId, MessageType};
use rmp_messaging::{InboundMessage, ManagerConfig, ReliableManager};
use rmp_transport::{HeapBufferProvider, InMemoryExchange, ManualTimer, SendError};

fuzz_target!(|data: &[u8]| {
    let clock = ManualClock::default();
    let config = ManagerConfig {
        retrans_table_size: 4,
        ..ManagerConfig::default()
    };
    let Ok(mut manager) = ReliableManager::new(
        config,
        Box::new(clock.clone()),
        Box::new(ManualTimer::default()),
        Box::new(HeapBufferProvider::with_budget(64)),
    ) else {
        return;
    };
    let exchange = InMemoryExchange::default();
    let id = manager.register_context(exchange.clone(), None);

    for op in data.chunks(2) {
        let arg = op.get(1).copied().unwrap_or(0);
        let message_id = MessageId(u32::from(arg & 0x0F));
        let Ok(mut ops) = manager.context_ops(id) else {
            return;
        };
        let _ = match op[0] % 8 {
            0 => ops.send_message(message_id, MessageType(1), Bytes::from_static(b"f")).map(|_| ()),
            1 => ops.handle_received_ack(message_id),
            2 => ops.handle_needs_ack(message_id, arg & 0x80 != 0),
            3 => ops.flush_pending_acks(),
            4 => ops
                .handle_inbound(InboundMessage {
                    message_id,
                    needs_ack: arg & 0x40 != 0,
                    is_duplicate: arg & 0x80 != 0,
                    piggyback_ack: (arg & 0x20 != 0).then_some(MessageId(u32::from(arg & 0x03))),
                }),
            5 => {
                exchange.fail_next_send(if arg & 1 == 0 {
                    SendError::Unreachable
                } else {
                    SendError::Closed
                });
                Ok(())
            }
            6 => ops.prepare_outbound().map(|_| ()),
            _ => {
                clock.advance(Duration::from_millis(u64::from(arg) * 4));
                manager.handle_timer_fired();
                Ok(())
            }
        };

        let ctx = manager.context(id).expect("context stays registered");
        assert_eq!(ctx.is_ack_pending(), ctx.pending_peer_ack_id().is_some());
        let live = manager.retrans_table().iter().count();
        assert_eq!(exchange.ref_count(), live as i64);
        assert!(live <= 4);
    }
});
