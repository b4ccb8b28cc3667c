use std::collections::HashSet;

use mixcade_message::{ClientId, MixPacket};
use rand::Rng;

/// One-direction packet store, kept sorted by sort key at all times.
///
/// Insertion finds the position by binary search and keeps ties stable
/// (equal keys stay in arrival order), so the same packet set always drains
/// in the same order regardless of how arrivals interleaved.
///
/// The store is owned by exactly one policy state machine, which is driven
/// from a single poll context. Admissions and drains therefore serialize by
/// construction; a drain can never observe a half-finished insert.
#[derive(Debug, Default)]
pub struct SimplexStore {
    packets: Vec<MixPacket>,
}

impl SimplexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            packets: Vec::with_capacity(capacity),
        }
    }

    /// Insert at the sort-key position; equal keys go after existing ones.
    pub fn add(&mut self, packet: MixPacket) {
        let position = self
            .packets
            .partition_point(|stored| stored.sort_key() <= packet.sort_key());
        self.packets.insert(position, packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Remove and return everything, in sort-key order.
    pub fn drain_all(&mut self) -> Vec<MixPacket> {
        std::mem::take(&mut self.packets)
    }

    /// Remove and return the first `count` packets in sort-key order.
    /// `count` must not exceed `len()`.
    pub fn drain_first(&mut self, count: usize) -> Vec<MixPacket> {
        debug_assert!(count <= self.packets.len());
        let remaining = self.packets.split_off(count);
        std::mem::replace(&mut self.packets, remaining)
    }

    /// Remove and return the packets the predicate selects. Both the
    /// returned packets and the ones left behind keep their relative order.
    pub fn drain_where<F>(&mut self, mut select: F) -> Vec<MixPacket>
    where
        F: FnMut(&MixPacket) -> bool,
    {
        let mut released = Vec::new();
        let mut kept = Vec::with_capacity(self.packets.len());
        for packet in self.packets.drain(..) {
            if select(&packet) {
                released.push(packet);
            } else {
                kept.push(packet);
            }
        }
        self.packets = kept;
        released
    }

    /// Remove and return `count` packets chosen uniformly at random without
    /// replacement, keeping the released set in sort-key order.
    pub fn drain_random<R: Rng>(&mut self, count: usize, rng: &mut R) -> Vec<MixPacket> {
        let count = count.min(self.packets.len());
        if count == 0 {
            return Vec::new();
        }
        let chosen: HashSet<usize> = rand::seq::index::sample(rng, self.packets.len(), count)
            .into_iter()
            .collect();
        let mut index = 0;
        self.drain_where(|_| {
            let selected = chosen.contains(&index);
            index += 1;
            selected
        })
    }

    /// Distinct owners currently represented in the store.
    pub fn owners(&self) -> HashSet<ClientId> {
        self.packets.iter().map(MixPacket::owner).collect()
    }
}
