use std::collections::VecDeque;
use std::task::{Context, Poll};

use mixcade_message::{Direction, MixPacket};

use crate::policy::ReleasePolicy;
use crate::{ReleaseBatch, TriggerReason};

/// Pass-through baseline: every packet goes straight out on its own.
/// No store, no timer; only useful as a control against the real policies.
pub struct NoDelay {
    direction: Direction,
    ready: VecDeque<MixPacket>,
}

impl NoDelay {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            ready: VecDeque::new(),
        }
    }
}

impl ReleasePolicy for NoDelay {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        self.ready.push_back(packet);
    }

    fn poll_release(&mut self, _cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        match self.ready.pop_front() {
            Some(packet) => Poll::Ready(ReleaseBatch {
                direction: self.direction,
                trigger: TriggerReason::Threshold,
                packets: vec![packet],
            }),
            None => Poll::Pending,
        }
    }

    fn pending(&self) -> usize {
        self.ready.len()
    }

    fn drain_remaining(&mut self) -> Vec<MixPacket> {
        self.ready.drain(..).collect()
    }
}
