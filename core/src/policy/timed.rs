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
pub struct TimedBatchSettings {
    /// Interval between releases once the first packet has armed the timer.
    pub sending_rate: Duration,
}

impl Default for TimedBatchSettings {
    fn default() -> Self {
        Self {
            sending_rate: Duration::from_secs(1),
        }
    }
}

/// Timed mix: the first packet arms the timer; every `sending_rate` after
/// that, everything currently stored goes out, whatever the count.
///
/// Empty batches are emitted on purpose: once armed, the release cadence
/// carries no information about traffic volume.
pub struct TimedBatch {
    settings: TimedBatchSettings,
    direction: Direction,
    store: SimplexStore,
    interval: Option<FireInterval>,
}

impl TimedBatch {
    pub fn new(settings: TimedBatchSettings, direction: Direction) -> Result<Self, Error> {
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

impl ReleasePolicy for TimedBatch {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        self.store.add(packet);
        if self.interval.is_none() {
            // First packet ever: arm the cycle. The interval re-arms itself,
            // so later releases happen whether or not packets arrived.
            self.interval = Some(FireInterval::new(self.settings.sending_rate));
        }
    }

    fn poll_release(&mut self, cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        if let Some(interval) = self.interval.as_mut() {
            if interval.poll_tick(cx).is_ready() {
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

    #[test]
    fn zero_rate_is_rejected() {
        let settings = TimedBatchSettings {
            sending_rate: Duration::ZERO,
        };
        assert!(matches!(
            TimedBatch::new(settings, Direction::Request),
            Err(Error::InvalidSendingRate)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn releases_one_interval_after_first_packet() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = TimedBatchSettings {
            sending_rate: Duration::from_millis(100),
        };
        let policy = TimedBatch::new(settings, Direction::Request).unwrap();
        let mut stream = UnboundedReceiverStream::new(rx).release_with(Box::new(policy));

        time::advance(Duration::from_millis(10)).await;
        tx.send(packet(b"m")).unwrap();

        let started = Instant::now();
        let batch = stream.next().await.unwrap();
        assert_eq!(batch.trigger, TriggerReason::Timeout);
        assert_eq!(batch.len(), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn emits_empty_batches_at_steady_cadence() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = TimedBatchSettings {
            sending_rate: Duration::from_millis(100),
        };
        let policy = TimedBatch::new(settings, Direction::Reply).unwrap();
        let mut stream = UnboundedReceiverStream::new(rx).release_with(Box::new(policy));

        tx.send(packet(b"m")).unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.len(), 1);

        // No further traffic: the next cycle still fires, empty.
        let started = Instant::now();
        let second = stream.next().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(second.trigger, TriggerReason::Timeout);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }
}
