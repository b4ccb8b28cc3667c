pub mod dlpa;
pub mod no_delay;
pub mod pool;
pub mod stop_and_go;
pub mod threshold;
pub mod threshold_timed;
pub mod timed;

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use mixcade_message::{Direction, MixPacket};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::{ReleaseBatch, TriggerReason};

pub use dlpa::{Dlpa, DlpaSettings};
pub use no_delay::NoDelay;
pub use pool::{
    BinomialPool, BinomialPoolSettings, CottrellPool, CottrellPoolSettings, ThresholdPool,
    ThresholdPoolSettings,
};
pub use stop_and_go::{StopAndGo, StopAndGoSettings};
pub use threshold::{ThresholdBatch, ThresholdBatchSettings};
pub use threshold_timed::{ThresholdAndTimedBatch, ThresholdAndTimedBatchSettings};
pub use timed::{TimedBatch, TimedBatchSettings};

/// A release policy decides when, and which subset of, the packets it holds
/// go out together.
///
/// Both sides of the contract run on one poll context: `on_packet` is called
/// while draining the inbound channel, `poll_release` right after, so timer
/// fires and admissions can never race on the underlying store.
pub trait ReleasePolicy: Send {
    fn direction(&self) -> Direction;

    /// Admit one packet. Must return quickly; no blocking, no I/O.
    fn on_packet(&mut self, packet: MixPacket);

    /// Timer-driven side of the policy.
    fn poll_release(&mut self, cx: &mut Context<'_>) -> Poll<ReleaseBatch>;

    /// Packets currently held and not yet part of an emitted batch.
    fn pending(&self) -> usize;

    /// Hand back everything still held, for the final flush on shutdown.
    /// No packet may be silently dropped.
    fn drain_remaining(&mut self) -> Vec<MixPacket>;
}

/// Which policy to run, with its parameters. Consumed once at construction;
/// there is no hot reload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PolicySettings {
    NoDelay,
    ThresholdBatch(ThresholdBatchSettings),
    TimedBatch(TimedBatchSettings),
    ThresholdAndTimedBatch(ThresholdAndTimedBatchSettings),
    BinomialPool(BinomialPoolSettings),
    CottrellPool(CottrellPoolSettings),
    ThresholdPool(ThresholdPoolSettings),
    StopAndGo(StopAndGoSettings),
    Dlpa(DlpaSettings),
}

impl PolicySettings {
    /// Validate the parameters and build the policy for one direction.
    /// Invalid settings are fatal here; the mix must not start with them.
    pub fn build(&self, direction: Direction) -> Result<Box<dyn ReleasePolicy>, Error> {
        Ok(match self {
            Self::NoDelay => Box::new(NoDelay::new(direction)),
            Self::ThresholdBatch(settings) => Box::new(ThresholdBatch::new(*settings, direction)?),
            Self::TimedBatch(settings) => Box::new(TimedBatch::new(*settings, direction)?),
            Self::ThresholdAndTimedBatch(settings) => {
                Box::new(ThresholdAndTimedBatch::new(*settings, direction)?)
            }
            Self::BinomialPool(settings) => Box::new(BinomialPool::new(*settings, direction)?),
            Self::CottrellPool(settings) => Box::new(CottrellPool::new(*settings, direction)?),
            Self::ThresholdPool(settings) => Box::new(ThresholdPool::new(*settings, direction)?),
            Self::StopAndGo(settings) => Box::new(StopAndGo::new(*settings, direction)?),
            Self::Dlpa(settings) => Box::new(Dlpa::new(*settings, direction)?),
        })
    }
}

/// Drives a [`ReleasePolicy`] from a packet stream and yields its releases.
///
/// When the input stream ends, everything the policy still holds is emitted
/// as one final batch before the stream terminates, so the multiset of
/// released packets always equals the multiset of admitted ones.
pub struct PolicyStream<S> {
    input: S,
    policy: Box<dyn ReleasePolicy>,
    input_done: bool,
    flushed: bool,
}

impl<S> PolicyStream<S> {
    pub fn new(input: S, policy: Box<dyn ReleasePolicy>) -> Self {
        Self {
            input,
            policy,
            input_done: false,
            flushed: false,
        }
    }

    pub fn pending(&self) -> usize {
        self.policy.pending()
    }
}

impl<S> Stream for PolicyStream<S>
where
    S: Stream<Item = MixPacket> + Unpin,
{
    type Item = ReleaseBatch;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while !this.input_done {
            match this.input.poll_next_unpin(cx) {
                Poll::Ready(Some(packet)) => this.policy.on_packet(packet),
                Poll::Ready(None) => this.input_done = true,
                Poll::Pending => break,
            }
        }

        if this.input_done {
            if this.flushed {
                return Poll::Ready(None);
            }
            this.flushed = true;
            let packets = this.policy.drain_remaining();
            return if packets.is_empty() {
                Poll::Ready(None)
            } else {
                Poll::Ready(Some(ReleaseBatch {
                    direction: this.policy.direction(),
                    trigger: TriggerReason::Timeout,
                    packets,
                }))
            };
        }

        this.policy.poll_release(cx).map(Some)
    }
}

pub trait ReleasePolicyExt: Stream<Item = MixPacket> {
    fn release_with(self, policy: Box<dyn ReleasePolicy>) -> PolicyStream<Self>
    where
        Self: Sized + Unpin,
    {
        PolicyStream::new(self, policy)
    }
}

impl<T> ReleasePolicyExt for T where T: Stream<Item = MixPacket> {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mixcade_message::ClientId;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn packet(key: &[u8]) -> MixPacket {
        MixPacket::new(Direction::Request, ClientId::new([0; 16]), key.to_vec())
    }

    #[tokio::test]
    async fn stream_yields_policy_releases() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = ThresholdBatchSettings { batch_size: 2 };
        let mut stream = UnboundedReceiverStream::new(rx)
            .release_with(PolicySettings::ThresholdBatch(settings).build(Direction::Request).unwrap());

        tx.send(packet(b"b")).unwrap();
        tx.send(packet(b"a")).unwrap();
        let batch = stream.next().await.unwrap();
        assert_eq!(batch.trigger, TriggerReason::Threshold);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.packets[0].sort_key(), b"a");
        assert_eq!(batch.packets[1].sort_key(), b"b");
    }

    #[tokio::test]
    async fn remaining_packets_flush_when_input_ends() {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = ThresholdBatchSettings { batch_size: 10 };
        let mut stream = UnboundedReceiverStream::new(rx)
            .release_with(PolicySettings::ThresholdBatch(settings).build(Direction::Reply).unwrap());

        tx.send(packet(b"x")).unwrap();
        tx.send(packet(b"y")).unwrap();
        drop(tx);

        let batch = stream.next().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn invalid_settings_refuse_to_build() {
        let settings = PolicySettings::ThresholdBatch(ThresholdBatchSettings { batch_size: 0 });
        assert!(settings.build(Direction::Request).is_err());
    }
}
