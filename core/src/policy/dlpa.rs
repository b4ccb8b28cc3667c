use std::collections::{HashSet, VecDeque};
use std::task::{Context, Poll};
use std::time::Duration;

use mixcade_message::{ClientId, Direction, MixPacket};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Error;
use crate::policy::ReleasePolicy;
use crate::store::SimplexStore;
use crate::timer::OneShot;
use crate::{ReleaseBatch, TriggerReason};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DlpaSettings {
    /// Longest a packet may wait before its slot must be put out.
    pub max_delay: Duration,
}

/// Dependent-link-padding mix: packets are grouped into output slots, each
/// with a deadline one `max_delay` after its creation and room for one
/// packet per distinct sender seen so far.
///
/// A packet joins the first slot, in insertion order, that holds nothing
/// from its own sender and whose deadline is still within the packet's own
/// maximum delay; otherwise it opens a new slot. A slot goes out when it
/// has one packet per known sender, or at its deadline, whichever first.
///
/// The one-packet-per-sender rule is the point of the scheme: a sender's
/// own traffic never satisfies the cover requirement for itself.
pub struct Dlpa {
    settings: DlpaSettings,
    direction: Direction,
    slots: VecDeque<Slot>,
    senders_seen: HashSet<ClientId>,
    ready: VecDeque<(TriggerReason, Vec<MixPacket>)>,
    timer: OneShot,
}

struct Slot {
    deadline: Instant,
    owners: HashSet<ClientId>,
    packets: SimplexStore,
}

impl Slot {
    fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            owners: HashSet::new(),
            packets: SimplexStore::new(),
        }
    }
}

impl Dlpa {
    pub fn new(settings: DlpaSettings, direction: Direction) -> Result<Self, Error> {
        if settings.max_delay.is_zero() {
            return Err(Error::InvalidMaxDelay);
        }
        Ok(Self {
            settings,
            direction,
            slots: VecDeque::new(),
            senders_seen: HashSet::new(),
            ready: VecDeque::new(),
            timer: OneShot::new(),
        })
    }

    /// Slots are created in deadline order, so the front is always the
    /// next one due.
    fn rearm(&mut self) {
        match self.slots.front() {
            Some(slot) => self.timer.arm_until(slot.deadline),
            None => self.timer.cancel(),
        }
    }

    fn flush_slot(&mut self, index: usize, trigger: TriggerReason) {
        if let Some(mut slot) = self.slots.remove(index) {
            self.ready.push_back((trigger, slot.packets.drain_all()));
        }
    }
}

impl ReleasePolicy for Dlpa {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        let now = Instant::now();
        let owner = packet.owner();
        self.senders_seen.insert(owner);

        let latest_acceptable = now + self.settings.max_delay;
        let position = self.slots.iter().position(|slot| {
            !slot.owners.contains(&owner) && slot.deadline <= latest_acceptable
        });
        match position {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.owners.insert(owner);
                slot.packets.add(packet);
                if slot.packets.len() == self.senders_seen.len() {
                    self.flush_slot(index, TriggerReason::Threshold);
                }
            }
            None => {
                let mut slot = Slot::new(now + self.settings.max_delay);
                slot.owners.insert(owner);
                slot.packets.add(packet);
                // A fresh slot can already be at capacity (one known sender).
                if slot.packets.len() == self.senders_seen.len() {
                    self.ready
                        .push_back((TriggerReason::Threshold, slot.packets.drain_all()));
                } else {
                    self.slots.push_back(slot);
                }
            }
        }
        self.rearm();
    }

    fn poll_release(&mut self, cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        loop {
            if let Some((trigger, packets)) = self.ready.pop_front() {
                return Poll::Ready(ReleaseBatch {
                    direction: self.direction,
                    trigger,
                    packets,
                });
            }
            if self.timer.poll_fired(cx).is_pending() {
                return Poll::Pending;
            }
            let now = Instant::now();
            while self
                .slots
                .front()
                .map_or(false, |slot| slot.deadline <= now)
            {
                self.flush_slot(0, TriggerReason::Timeout);
            }
            self.rearm();
        }
    }

    fn pending(&self) -> usize {
        self.slots.iter().map(|slot| slot.packets.len()).sum::<usize>()
            + self.ready.iter().map(|(_, packets)| packets.len()).sum::<usize>()
    }

    fn drain_remaining(&mut self) -> Vec<MixPacket> {
        self.timer.cancel();
        let mut packets: Vec<MixPacket> = self
            .ready
            .drain(..)
            .flat_map(|(_, packets)| packets)
            .collect();
        for mut slot in self.slots.drain(..) {
            packets.extend(slot.packets.drain_all());
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio::time;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::policy::ReleasePolicyExt;

    fn packet(owner: u8, key: &[u8]) -> MixPacket {
        MixPacket::new(Direction::Request, ClientId::new([owner; 16]), key.to_vec())
    }

    #[test]
    fn zero_delay_is_rejected() {
        let settings = DlpaSettings {
            max_delay: Duration::ZERO,
        };
        assert!(matches!(
            Dlpa::new(settings, Direction::Request),
            Err(Error::InvalidMaxDelay)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slot_flushes_when_every_sender_is_covered() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = DlpaSettings {
            max_delay: Duration::from_millis(500),
        };
        let policy = Dlpa::new(settings, Direction::Request).unwrap();
        let mut stream = UnboundedReceiverStream::new(rx).release_with(Box::new(policy));

        // With a single known sender, slot capacity is one: the very first
        // packet fills its slot and flushes on the spot, not at its deadline.
        let started = time::Instant::now();
        tx.send(packet(1, b"x")).unwrap();
        let opener = stream.next().await.unwrap();
        assert_eq!(opener.trigger, TriggerReason::Threshold);
        assert_eq!(opener.len(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);

        // Two senders known: the slot flushes once both are covered,
        // in sort-key order.
        tx.send(packet(2, b"b")).unwrap();
        tx.send(packet(1, b"a")).unwrap();
        let batch = stream.next().await.unwrap();
        assert_eq!(batch.trigger, TriggerReason::Threshold);
        let keys: Vec<&[u8]> = batch.packets.iter().map(|p| p.sort_key()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice()]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_sender_never_shares_a_slot() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = DlpaSettings {
            max_delay: Duration::from_millis(200),
        };
        let policy = Dlpa::new(settings, Direction::Request).unwrap();
        let mut stream = UnboundedReceiverStream::new(rx).release_with(Box::new(policy));

        // Make both senders known first.
        tx.send(packet(1, b"x")).unwrap();
        assert_eq!(stream.next().await.unwrap().len(), 1);
        tx.send(packet(2, b"o")).unwrap();
        tx.send(packet(1, b"p")).unwrap();
        assert_eq!(stream.next().await.unwrap().len(), 2);

        // Two packets from one sender: the second must open its own slot,
        // so each flushes alone at its deadline.
        tx.send(packet(1, b"y")).unwrap();
        tx.send(packet(1, b"z")).unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.trigger, TriggerReason::Timeout);
        assert_eq!(first.len(), 1);
        let second = stream.next().await.unwrap();
        assert_eq!(second.trigger, TriggerReason::Timeout);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unfilled_slot_flushes_at_its_deadline() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = DlpaSettings {
            max_delay: Duration::from_millis(300),
        };
        let policy = Dlpa::new(settings, Direction::Reply).unwrap();
        let mut stream = UnboundedReceiverStream::new(rx).release_with(Box::new(policy));

        tx.send(packet(1, b"x")).unwrap();
        assert_eq!(stream.next().await.unwrap().len(), 1);

        // Sender 2's packet waits for cover from sender 1 that never comes;
        // the deadline puts it out anyway.
        let started = time::Instant::now();
        tx.send(packet(2, b"w")).unwrap();
        let batch = stream.next().await.unwrap();
        assert_eq!(batch.trigger, TriggerReason::Timeout);
        assert_eq!(batch.len(), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }
}
