use std::task::{Context, Poll};
use std::time::Duration;

use mixcade_message::{Direction, MixPacket};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::ReleasePolicy;
use crate::store::SimplexStore;
use crate::timer::FireInterval;
use crate::{ReleaseBatch, TriggerReason};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ThresholdAndTimedBatchSettings {
    /// Minimum size a batch must exceed for a timer tick to release it.
    pub batch_size: usize,
    /// Interval between release checks.
    pub sending_rate: Duration,
}

/// Periodic release gated by a minimum size: a tick puts the batch out only
/// if strictly more than `batch_size` packets are stored; otherwise the
/// batch keeps growing until a later tick qualifies.
///
/// The threshold is checked at ticks only, never on admission, so the store
/// may grow without bound between fires. That is the intended semantics of
/// this policy (a timed release with a minimum, not a maximum).
pub struct ThresholdAndTimedBatch {
    settings: ThresholdAndTimedBatchSettings,
    direction: Direction,
    store: SimplexStore,
    interval: Option<FireInterval>,
}

impl ThresholdAndTimedBatch {
    pub fn new(
        settings: ThresholdAndTimedBatchSettings,
        direction: Direction,
    ) -> Result<Self, Error> {
        if settings.batch_size < 1 {
            return Err(Error::InvalidBatchSize);
        }
        if settings.sending_rate.is_zero() {
            return Err(Error::InvalidSendingRate);
        }
        Ok(Self {
            settings,
            direction,
            store: SimplexStore::new(),
            interval: None,
        })
    }
}

impl ReleasePolicy for ThresholdAndTimedBatch {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        self.store.add(packet);
        if self.interval.is_none() {
            self.interval = Some(FireInterval::new(self.settings.sending_rate));
        }
    }

    fn poll_release(&mut self, cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        let Some(interval) = self.interval.as_mut() else {
            return Poll::Pending;
        };
        // A tick that does not qualify still reschedules the next one.
        while interval.poll_tick(cx).is_ready() {
            if self.store.len() > self.settings.batch_size {
                return Poll::Ready(ReleaseBatch {
                    direction: self.direction,
                    trigger: TriggerReason::Timeout,
                    packets: self.store.drain_all(),
                });
            }
        }
        Poll::Pending
    }

    fn pending(&self) -> usize {
        self.store.len()
    }

    fn drain_remaining(&mut self) -> Vec<MixPacket> {
        self.store.drain_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mixcade_message::ClientId;
    use tokio::sync::mpsc;
    use tokio::time::{self, Instant};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::policy::ReleasePolicyExt;

    fn packet(key: &[u8]) -> MixPacket {
        MixPacket::new(Direction::Request, ClientId::new([0; 16]), key.to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn tick_below_threshold_keeps_collecting() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = ThresholdAndTimedBatchSettings {
            batch_size: 3,
            sending_rate: Duration::from_millis(100),
        };
        let policy = ThresholdAndTimedBatch::new(settings, Direction::Request).unwrap();
        let mut stream = UnboundedReceiverStream::new(rx).release_with(Box::new(policy));

        tx.send(packet(b"a")).unwrap();
        tx.send(packet(b"b")).unwrap();

        // Two ticks pass with size <= batch_size: nothing released.
        let waited = tokio::time::timeout(Duration::from_millis(250), stream.next()).await;
        assert!(waited.is_err());
        assert_eq!(stream.pending(), 2);

        // Two more packets push the store over the threshold; the next tick
        // releases everything collected so far.
        tx.send(packet(b"c")).unwrap();
        tx.send(packet(b"d")).unwrap();
        let batch = stream.next().await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.trigger, TriggerReason::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn release_happens_only_on_tick_boundaries() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = ThresholdAndTimedBatchSettings {
            batch_size: 1,
            sending_rate: Duration::from_millis(100),
        };
        let policy = ThresholdAndTimedBatch::new(settings, Direction::Reply).unwrap();
        let mut stream = UnboundedReceiverStream::new(rx).release_with(Box::new(policy));

        tx.send(packet(b"a")).unwrap();
        tx.send(packet(b"b")).unwrap();

        let started = Instant::now();
        let batch = stream.next().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(100));

        // Exceeding the threshold mid-cycle does not release early.
        tx.send(packet(b"c")).unwrap();
        tx.send(packet(b"d")).unwrap();
        time::advance(Duration::from_millis(50)).await;
        let batch = stream.next().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }
}
