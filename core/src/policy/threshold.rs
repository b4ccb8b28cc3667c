use std::collections::VecDeque;
use std::task::{Context, Poll};

use mixcade_message::{Direction, MixPacket};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::ReleasePolicy;
use crate::store::SimplexStore;
use crate::{ReleaseBatch, TriggerReason};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ThresholdBatchSettings {
    /// The exact number of packets a batch must reach before it goes out.
    pub batch_size: usize,
}

impl Default for ThresholdBatchSettings {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// Classic threshold mix: collect until exactly `batch_size` packets are
/// stored, then release them all in sort-key order and start over.
///
/// There is no timer. If traffic never reaches the threshold, packets wait
/// indefinitely; that is the documented latency/anonymity trade-off of this
/// policy, not a fault.
pub struct ThresholdBatch {
    settings: ThresholdBatchSettings,
    direction: Direction,
    store: SimplexStore,
    ready: VecDeque<Vec<MixPacket>>,
}

impl ThresholdBatch {
    pub fn new(settings: ThresholdBatchSettings, direction: Direction) -> Result<Self, Error> {
        if settings.batch_size < 1 {
            return Err(Error::InvalidBatchSize);
        }
        Ok(Self {
            settings,
            direction,
            store: SimplexStore::with_capacity(settings.batch_size),
            ready: VecDeque::new(),
        })
    }
}

impl ReleasePolicy for ThresholdBatch {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        self.store.add(packet);
        if self.store.len() == self.settings.batch_size {
            self.ready.push_back(self.store.drain_all());
        }
    }

    fn poll_release(&mut self, _cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        match self.ready.pop_front() {
            Some(packets) => Poll::Ready(ReleaseBatch {
                direction: self.direction,
                trigger: TriggerReason::Threshold,
                packets,
            }),
            None => Poll::Pending,
        }
    }

    fn pending(&self) -> usize {
        self.store.len() + self.ready.iter().map(Vec::len).sum::<usize>()
    }

    fn drain_remaining(&mut self) -> Vec<MixPacket> {
        let mut packets: Vec<MixPacket> = self.ready.drain(..).flatten().collect();
        packets.extend(self.store.drain_all());
        packets
    }
}
