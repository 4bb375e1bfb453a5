//! # STRATUM Event Bus
//!
//! Hands world-layer side effects from the simulation step to whoever
//! cares (gameplay, debug overlays, telemetry).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      ┌─────────────┐      ┌──────────────┐
//! │ WorldLayers  │─────>│   Bounded   │─────>│  Consumers   │
//! │   ::step     │      │   Channel   │      │ (any thread) │
//! └──────────────┘      └─────────────┘      └──────────────┘
//! ```
//!
//! Publishing never blocks the step: when the channel is full the event is
//! dropped and counted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use stratum_layers::StreamingEvent;
use stratum_mask::MaskError;

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Events published by [`crate::WorldLayers`].
#[derive(Clone, Debug, PartialEq)]
pub enum WorldLayerEvent {
    // =========================================================================
    // Mask Events
    // =========================================================================
    /// A mask finished decoding and is now sampled.
    MaskLoaded {
        /// Mask source path.
        path: PathBuf,
    },

    /// A mask failed to decode. Its layers read as inactive until the mask
    /// is invalidated.
    MaskFailed {
        /// Mask source path.
        path: PathBuf,
        /// Why.
        error: MaskError,
    },

    // =========================================================================
    // Streaming Events
    // =========================================================================
    /// Load/unload side effect of the streaming controller.
    Streaming(StreamingEvent),
}

/// Bounded event channel.
pub struct EventBus {
    sender: Sender<WorldLayerEvent>,
    receiver: Receiver<WorldLayerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates a bus holding at most `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Producer handle.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Consumer handle (clones share one queue).
    #[must_use]
    pub fn receiver(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.receiver.clone(),
        }
    }

    /// Events dropped because the channel was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Handle for publishing events.
#[derive(Clone)]
pub struct EventSender {
    sender: Sender<WorldLayerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Publishes without blocking. Returns false if the event was dropped.
    #[inline]
    pub fn send(&self, event: WorldLayerEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Handle for consuming events.
#[derive(Clone)]
pub struct EventReceiver {
    receiver: Receiver<WorldLayerEvent>,
}

impl EventReceiver {
    /// Takes every pending event.
    #[inline]
    pub fn drain(&self) -> Vec<WorldLayerEvent> {
        self.receiver.try_iter().collect()
    }

    /// Takes one pending event.
    #[inline]
    pub fn try_recv(&self) -> Option<WorldLayerEvent> {
        self.receiver.try_recv().ok()
    }

    /// Number of pending events.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    /// True if events are pending.
    #[inline]
    #[must_use]
    pub fn has_events(&self) -> bool {
        !self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_shared::CellCoord;

    fn evicted(x: i32) -> WorldLayerEvent {
        WorldLayerEvent::Streaming(StreamingEvent::CellEvicted {
            cell: CellCoord::new(x, 0),
        })
    }

    #[test]
    fn test_send_receive_in_order() {
        let bus = EventBus::new(16);
        let sender = bus.sender();
        let receiver = bus.receiver();

        assert!(sender.send(WorldLayerEvent::MaskLoaded {
            path: PathBuf::from("a.png"),
        }));
        assert!(sender.send(evicted(1)));
        assert_eq!(receiver.pending_count(), 2);

        let events = receiver.drain();
        assert_eq!(events[1], evicted(1));
        assert!(!receiver.has_events());
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let bus = EventBus::new(2);
        let sender = bus.sender();
        assert!(sender.send(evicted(0)));
        assert!(sender.send(evicted(1)));
        assert!(!sender.send(evicted(2)));
        assert_eq!(bus.dropped(), 1);
        assert_eq!(bus.receiver().try_recv(), Some(evicted(0)));
    }
}
