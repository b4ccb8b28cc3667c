use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use mixcade_message::{BatchSizeAnnouncement, Direction, MixPacket};
use serde::{Deserialize, Serialize};

use crate::store::SimplexStore;
use crate::{ReleaseBatch, TriggerReason};

/// Where this mix sits in its cascade.
///
/// The first mix is the source of timing and never waits for an
/// announcement; the last mix has no successor to announce to. A
/// single-mix deployment is both.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CascadeSettings {
    pub first_mix: bool,
    pub last_mix: bool,
    /// Position of this mix in the cascade, carried in announcements.
    pub mix_sequence: u32,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            first_mix: true,
            last_mix: true,
            mix_sequence: 0,
        }
    }
}

/// Progress of a batch the synchronizer is still holding back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitingState {
    pub collected: usize,
    pub expected: usize,
}

/// Operator-visible view of a possibly stalled synchronized lane.
///
/// A cascade that desynchronizes stalls here by design (back-pressure, not
/// an error); this gauge is what external supervision watches to tell a
/// stall from normal collection.
#[derive(Debug, Default)]
pub struct WaitingGauge {
    waiting: AtomicBool,
    collected: AtomicUsize,
    expected: AtomicUsize,
}

impl WaitingGauge {
    fn set(&self, collected: usize, expected: usize) {
        self.collected.store(collected, Ordering::Relaxed);
        self.expected.store(expected, Ordering::Relaxed);
        self.waiting.store(true, Ordering::Release);
    }

    fn clear(&self) {
        self.waiting.store(false, Ordering::Release);
    }

    pub fn get(&self) -> Option<WaitingState> {
        if self.waiting.load(Ordering::Acquire) {
            Some(WaitingState {
                collected: self.collected.load(Ordering::Relaxed),
                expected: self.expected.load(Ordering::Relaxed),
            })
        } else {
            None
        }
    }
}

/// Release mechanism of a non-first mix: a batch goes out exactly when the
/// count its predecessor announced has been collected locally, never
/// before and never with a different size.
///
/// Waiting is expressed by simply not releasing; no lock is held in the
/// meantime, so producers keep feeding the store and the awaited packets
/// can actually arrive.
pub struct BatchSynchronizer {
    direction: Direction,
    store: SimplexStore,
    expectations: VecDeque<usize>,
    gauge: Arc<WaitingGauge>,
}

impl BatchSynchronizer {
    pub fn new(direction: Direction, gauge: Arc<WaitingGauge>) -> Self {
        Self {
            direction,
            store: SimplexStore::new(),
            expectations: VecDeque::new(),
            gauge,
        }
    }

    pub fn on_packet(&mut self, packet: MixPacket) {
        self.store.add(packet);
        self.update_gauge();
    }

    pub fn on_announcement(&mut self, announcement: BatchSizeAnnouncement) {
        tracing::debug!(
            expected = announcement.expected_count,
            from = announcement.from_mix_sequence,
            "batch size announced by predecessor"
        );
        self.expectations.push_back(announcement.expected_count);
        self.update_gauge();
    }

    /// Release the front batch if its announced count has been collected.
    pub fn try_release(&mut self) -> Option<ReleaseBatch> {
        let expected = *self.expectations.front()?;
        if self.store.len() < expected {
            self.update_gauge();
            return None;
        }
        self.expectations.pop_front();
        let packets = self.store.drain_first(expected);
        self.update_gauge();
        Some(ReleaseBatch {
            direction: self.direction,
            trigger: TriggerReason::Threshold,
            packets,
        })
    }

    pub fn pending(&self) -> usize {
        self.store.len()
    }

    pub fn drain_remaining(&mut self) -> Vec<MixPacket> {
        self.expectations.clear();
        self.gauge.clear();
        self.store.drain_all()
    }

    fn update_gauge(&self) {
        match self.expectations.front() {
            Some(&expected) if self.store.len() < expected => {
                self.gauge.set(self.store.len(), expected)
            }
            _ => self.gauge.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixcade_message::ClientId;

    fn packet(key: &[u8]) -> MixPacket {
        MixPacket::new(Direction::Request, ClientId::new([0; 16]), key.to_vec())
    }

    #[test]
    fn holds_back_until_announced_count_collected() {
        let gauge = Arc::new(WaitingGauge::default());
        let mut sync = BatchSynchronizer::new(Direction::Request, gauge.clone());

        sync.on_announcement(BatchSizeAnnouncement {
            expected_count: 3,
            from_mix_sequence: 1,
        });
        sync.on_packet(packet(b"b"));
        sync.on_packet(packet(b"a"));
        assert!(sync.try_release().is_none());
        assert_eq!(
            gauge.get(),
            Some(WaitingState {
                collected: 2,
                expected: 3
            })
        );

        sync.on_packet(packet(b"c"));
        let batch = sync.try_release().unwrap();
        assert_eq!(batch.len(), 3);
        let keys: Vec<&[u8]> = batch.packets.iter().map(|p| p.sort_key()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
        assert!(gauge.get().is_none());
    }

    #[test]
    fn packets_without_announcement_wait() {
        let gauge = Arc::new(WaitingGauge::default());
        let mut sync = BatchSynchronizer::new(Direction::Reply, gauge);

        sync.on_packet(packet(b"x"));
        sync.on_packet(packet(b"y"));
        assert!(sync.try_release().is_none());
        assert_eq!(sync.pending(), 2);
    }

    #[test]
    fn queued_announcements_release_in_order() {
        let gauge = Arc::new(WaitingGauge::default());
        let mut sync = BatchSynchronizer::new(Direction::Request, gauge);

        sync.on_announcement(BatchSizeAnnouncement {
            expected_count: 1,
            from_mix_sequence: 0,
        });
        sync.on_announcement(BatchSizeAnnouncement {
            expected_count: 2,
            from_mix_sequence: 0,
        });
        for key in [b"a", b"b", b"c"] {
            sync.on_packet(packet(key));
        }
        assert_eq!(sync.try_release().unwrap().len(), 1);
        assert_eq!(sync.try_release().unwrap().len(), 2);
        assert!(sync.try_release().is_none());
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn empty_announced_batch_releases_empty() {
        let gauge = Arc::new(WaitingGauge::default());
        let mut sync = BatchSynchronizer::new(Direction::Request, gauge);

        sync.on_announcement(BatchSizeAnnouncement {
            expected_count: 0,
            from_mix_sequence: 2,
        });
        let batch = sync.try_release().unwrap();
        assert!(batch.is_empty());
    }
}
