use std::cmp::Ordering;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Opaque identity of the client (channel owner) a packet belongs to.
///
/// The batching core never looks inside it; it is only compared for
/// fairness rules (e.g. one packet per owner in a padding slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId([u8; 16]);

impl ClientId {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for ClientId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Request,
    Reply,
}

/// A recoded message waiting to be batched and put out.
///
/// Packets are immutable after construction and are consumed exactly once:
/// the layer above hands them to the batching core, and the core hands each
/// of them to the output sink in exactly one release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixPacket {
    direction: Direction,
    owner: ClientId,
    payload: Box<[u8]>,
    created_at: SystemTime,
    is_dummy: bool,
    sort_key: Box<[u8]>,
}

impl MixPacket {
    /// A real-traffic packet. The sort key defaults to the payload bytes,
    /// which is what decouples release order from arrival order.
    pub fn new(direction: Direction, owner: ClientId, payload: Vec<u8>) -> Self {
        let sort_key = payload.clone().into_boxed_slice();
        Self {
            direction,
            owner,
            payload: payload.into_boxed_slice(),
            created_at: SystemTime::now(),
            is_dummy: false,
            sort_key,
        }
    }

    /// A real-traffic packet with an explicit sort key (e.g. the recoded
    /// ciphertext when the payload itself must stay out of comparisons).
    pub fn with_sort_key(
        direction: Direction,
        owner: ClientId,
        payload: Vec<u8>,
        sort_key: Vec<u8>,
    ) -> Self {
        Self {
            direction,
            owner,
            payload: payload.into_boxed_slice(),
            created_at: SystemTime::now(),
            is_dummy: false,
            sort_key: sort_key.into_boxed_slice(),
        }
    }

    /// A cover-traffic packet with no real payload.
    pub fn dummy(direction: Direction, owner: ClientId) -> Self {
        Self {
            direction,
            owner,
            payload: Box::default(),
            created_at: SystemTime::now(),
            is_dummy: true,
            sort_key: Box::default(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn is_dummy(&self) -> bool {
        self.is_dummy
    }

    pub fn sort_key(&self) -> &[u8] {
        &self.sort_key
    }

    /// The canonical release order: lexicographic over the sort key.
    /// Equal keys are left to the container's stable insertion rule.
    pub fn cmp_sort_key(&self, other: &Self) -> Ordering {
        self.sort_key.cmp(&other.sort_key)
    }
}

/// Control message sent mix-to-mix ahead of a data batch, telling the
/// successor how many packets the corresponding batch carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSizeAnnouncement {
    pub expected_count: usize,
    pub from_mix_sequence: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_key_defaults_to_payload() {
        let packet = MixPacket::new(Direction::Request, ClientId::new([0; 16]), vec![3, 1, 2]);
        assert_eq!(packet.sort_key(), &[3, 1, 2]);
        assert!(!packet.is_dummy());
    }

    #[test]
    fn dummy_has_empty_payload() {
        let packet = MixPacket::dummy(Direction::Reply, ClientId::new([7; 16]));
        assert!(packet.is_dummy());
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn sort_key_order_is_lexicographic() {
        let owner = ClientId::new([1; 16]);
        let a = MixPacket::new(Direction::Request, owner, b"a".to_vec());
        let b = MixPacket::new(Direction::Request, owner, b"b".to_vec());
        assert_eq!(a.cmp_sort_key(&b), Ordering::Less);
        assert_eq!(b.cmp_sort_key(&a), Ordering::Greater);
        assert_eq!(a.cmp_sort_key(&a), Ordering::Equal);
    }
}
