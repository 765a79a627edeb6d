// Engine notifications
// Channel-based observer fan-out; the core never depends on a GUI loop

use crate::source::SourceId;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Something the engine wants observers to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum MixerEvent {
    SourceAdded(SourceId),
    SourceRemoved(SourceId),
    /// The source consumed a fresh frame this tick.
    SourceUpdated(SourceId),
    /// An effect stage failed and was evicted from its chain.
    PluginFailed {
        source: SourceId,
        stage: usize,
        name: String,
        reason: String,
    },
    /// A producer thread reported an unrecoverable error; the source left
    /// the playing state.
    ProducerFailed {
        source: SourceId,
        reason: String,
    },
    /// The previous-frame composite is available to loopback sources.
    LoopbackReady,
    /// A producer overwrote a frame the consumer never took.
    FrameDropped(SourceId),
}

/// Fan-out of [`MixerEvent`] to any number of subscribers.
///
/// Subscribers that drop their receiver are pruned on the next emit.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<MixerEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; events emitted from now on are delivered to
    /// the returned receiver.
    pub fn subscribe(&self) -> Receiver<MixerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: MixerEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_receive_events() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        hub.emit(MixerEvent::LoopbackReady);
        assert_eq!(a.try_recv().unwrap(), MixerEvent::LoopbackReady);
        assert_eq!(b.try_recv().unwrap(), MixerEvent::LoopbackReady);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        {
            let _b = hub.subscribe();
        }
        hub.emit(MixerEvent::SourceAdded(SourceId(7)));
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(a.try_recv().unwrap(), MixerEvent::SourceAdded(SourceId(7)));
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let hub = EventHub::new();
        hub.emit(MixerEvent::LoopbackReady);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
