pub mod cascade;
pub mod engine;
pub mod error;
pub mod policy;
pub mod store;
pub mod timer;

pub use error::Error;

use mixcade_message::{Direction, MixPacket};

/// Why a release fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerReason {
    Threshold,
    Timeout,
    Probabilistic,
}

/// One release: the ordered set of packets a policy decided to put out
/// together. Packets admitted after the trigger decision latched are never
/// part of it.
#[derive(Debug)]
pub struct ReleaseBatch {
    pub direction: Direction,
    pub trigger: TriggerReason,
    pub packets: Vec<MixPacket>,
}

impl ReleaseBatch {
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
