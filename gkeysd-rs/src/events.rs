/* Notifications flowing out of the device threads and the registry.
 *
 * Emitting never blocks: the daemon's sink pushes onto an unbounded channel
 * drained by the D-Bus signal task. */
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::{Bank, DeviceId};
use crate::keys::Key;
use crate::macros::Macro;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    DevicesStarted(Vec<DeviceId>),
    DevicesStopped(Vec<DeviceId>),
    DevicesUnplugged(Vec<DeviceId>),
    BankSwitched {
        id: DeviceId,
        bank: Bank,
    },
    MacroRecorded {
        id: DeviceId,
        bank: Bank,
        gkey: Key,
        events: Macro,
    },
    MacroCleared {
        id: DeviceId,
        bank: Bank,
        gkey: Key,
    },
    GKeyPressed {
        id: DeviceId,
        bank: Bank,
        gkey: Key,
    },
    MediaKeyPressed {
        id: DeviceId,
        key: &'static str,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DaemonEvent);
}

/* Sink feeding the signal emitter task. */
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DaemonEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DaemonEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: DaemonEvent) {
        /* The receiver only goes away during shutdown. */
        if let Err(e) = self.tx.send(event) {
            debug!("Dropping event, signal task is gone: {:?}", e.0);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;

    /* Sink keeping every event for later inspection. */
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<DaemonEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<DaemonEvent> {
            self.events.lock().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: DaemonEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        let id = DeviceId::from_bus(1, 4);
        sink.emit(DaemonEvent::DevicesStarted(vec![id.clone()]));
        sink.emit(DaemonEvent::BankSwitched {
            id: id.clone(),
            bank: Bank::M2,
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            DaemonEvent::DevicesStarted(vec![id.clone()])
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            DaemonEvent::BankSwitched { id, bank: Bank::M2 }
        );
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(DaemonEvent::DevicesStopped(Vec::new()));
    }
}
