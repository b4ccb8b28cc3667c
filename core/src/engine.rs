use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use mixcade_message::{BatchSizeAnnouncement, Direction, MixPacket};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::cascade::{BatchSynchronizer, CascadeSettings, WaitingGauge, WaitingState};
use crate::error::Error;
use crate::policy::{PolicySettings, ReleasePolicy};
use crate::{ReleaseBatch, TriggerReason};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixEngineSettings {
    pub request_policy: PolicySettings,
    pub reply_policy: PolicySettings,
    pub cascade: CascadeSettings,
}

/// Where released packets go. Called after a batch has been fully drained
/// from its store, outside any policy state, so a slow sink never stalls
/// admission of new packets.
pub trait OutputSink: Send {
    /// Transmit one released request packet. Called once per packet of a
    /// batch, in the batch's order.
    fn put_out_request(&mut self, packet: MixPacket);
    /// Transmit one released reply packet.
    fn put_out_reply(&mut self, packet: MixPacket);
    /// Tell the neighbor mix how many packets the next batch carries.
    /// Sent ahead of the batch's packets.
    fn announce_next(&mut self, direction: Direction, announcement: BatchSizeAnnouncement);
}

enum LaneEvent {
    Packet(MixPacket),
    Announcement(BatchSizeAnnouncement),
}

/// Release mechanism of one direction: either the local policy decides
/// (timing source), or the predecessor's announcements do (synchronized).
enum LaneMode {
    Policy(Box<dyn ReleasePolicy>),
    Synchronized(BatchSynchronizer),
}

/// One direction of the mix. Everything that can touch the store — packet
/// admissions, announcements, timer fires — funnels through this single
/// poll context, which is the engine's whole concurrency story.
struct Lane {
    input: UnboundedReceiverStream<LaneEvent>,
    mode: LaneMode,
    direction: Direction,
    input_done: bool,
    flushed: bool,
}

impl Lane {
    fn new(
        direction: Direction,
        mode: LaneMode,
        input: UnboundedReceiverStream<LaneEvent>,
    ) -> Self {
        Self {
            input,
            mode,
            direction,
            input_done: false,
            flushed: false,
        }
    }

    fn drain_remaining(&mut self) -> Vec<MixPacket> {
        match &mut self.mode {
            LaneMode::Policy(policy) => policy.drain_remaining(),
            LaneMode::Synchronized(sync) => sync.drain_remaining(),
        }
    }
}

impl Stream for Lane {
    type Item = ReleaseBatch;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while !this.input_done {
            match this.input.poll_next_unpin(cx) {
                Poll::Ready(Some(LaneEvent::Packet(packet))) => match &mut this.mode {
                    LaneMode::Policy(policy) => policy.on_packet(packet),
                    LaneMode::Synchronized(sync) => sync.on_packet(packet),
                },
                Poll::Ready(Some(LaneEvent::Announcement(announcement))) => match &mut this.mode {
                    LaneMode::Synchronized(sync) => sync.on_announcement(announcement),
                    LaneMode::Policy(_) => {
                        tracing::debug!(
                            direction = ?this.direction,
                            "ignoring batch size announcement on an unsynchronized lane"
                        );
                    }
                },
                Poll::Ready(None) => this.input_done = true,
                Poll::Pending => break,
            }
        }

        if this.input_done {
            if this.flushed {
                return Poll::Ready(None);
            }
            this.flushed = true;
            let packets = this.drain_remaining();
            return if packets.is_empty() {
                Poll::Ready(None)
            } else {
                Poll::Ready(Some(ReleaseBatch {
                    direction: this.direction,
                    trigger: TriggerReason::Timeout,
                    packets,
                }))
            };
        }

        match &mut this.mode {
            LaneMode::Policy(policy) => policy.poll_release(cx).map(Some),
            LaneMode::Synchronized(sync) => match sync.try_release() {
                Some(batch) => Poll::Ready(Some(batch)),
                None => Poll::Pending,
            },
        }
    }
}

/// Producer-side handle to a running engine. Cloned freely across the
/// transport's connection tasks; all calls are non-blocking sends.
#[derive(Clone)]
pub struct MixEngineHandle {
    request_tx: mpsc::UnboundedSender<LaneEvent>,
    reply_tx: mpsc::UnboundedSender<LaneEvent>,
    request_gauge: Arc<WaitingGauge>,
    reply_gauge: Arc<WaitingGauge>,
}

impl MixEngineHandle {
    /// Hand a recoded request packet to the batching core.
    pub fn add_request(&self, packet: MixPacket) -> Result<(), Error> {
        self.request_tx
            .send(LaneEvent::Packet(packet))
            .map_err(|_| Error::EngineStopped)
    }

    /// Hand a recoded reply packet to the batching core.
    pub fn add_reply(&self, packet: MixPacket) -> Result<(), Error> {
        self.reply_tx
            .send(LaneEvent::Packet(packet))
            .map_err(|_| Error::EngineStopped)
    }

    /// Feed a neighbor's batch size announcement into the lane it gates.
    pub fn announce(
        &self,
        direction: Direction,
        announcement: BatchSizeAnnouncement,
    ) -> Result<(), Error> {
        let tx = match direction {
            Direction::Request => &self.request_tx,
            Direction::Reply => &self.reply_tx,
        };
        tx.send(LaneEvent::Announcement(announcement))
            .map_err(|_| Error::EngineStopped)
    }

    /// Progress of a held-back synchronized batch, if one is waiting.
    pub fn waiting_state(&self, direction: Direction) -> Option<WaitingState> {
        match direction {
            Direction::Request => self.request_gauge.get(),
            Direction::Reply => self.reply_gauge.get(),
        }
    }
}

/// The batching core of one mix: a request lane and a reply lane, each with
/// its own release mechanism, both delivering into one [`OutputSink`].
pub struct MixEngine<O> {
    request_lane: Lane,
    reply_lane: Lane,
    output: O,
    cascade: CascadeSettings,
}

impl<O: OutputSink> MixEngine<O> {
    /// Validate the settings and build the engine plus its producer handle.
    /// Any invalid policy parameter fails here, before anything runs.
    pub fn new(settings: MixEngineSettings, output: O) -> Result<(Self, MixEngineHandle), Error> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let request_gauge = Arc::new(WaitingGauge::default());
        let reply_gauge = Arc::new(WaitingGauge::default());

        // Both policies are built up front so invalid parameters fail even
        // on lanes that end up synchronized and never run them.
        let request_policy = settings.request_policy.build(Direction::Request)?;
        let reply_policy = settings.reply_policy.build(Direction::Reply)?;

        // Requests flow head-to-tail, replies tail-to-head: a lane waits for
        // announcements unless this mix is the entry point for its direction.
        let request_mode = if settings.cascade.first_mix {
            LaneMode::Policy(request_policy)
        } else {
            LaneMode::Synchronized(BatchSynchronizer::new(
                Direction::Request,
                request_gauge.clone(),
            ))
        };
        let reply_mode = if settings.cascade.last_mix {
            LaneMode::Policy(reply_policy)
        } else {
            LaneMode::Synchronized(BatchSynchronizer::new(Direction::Reply, reply_gauge.clone()))
        };

        let engine = Self {
            request_lane: Lane::new(
                Direction::Request,
                request_mode,
                UnboundedReceiverStream::new(request_rx),
            ),
            reply_lane: Lane::new(
                Direction::Reply,
                reply_mode,
                UnboundedReceiverStream::new(reply_rx),
            ),
            output,
            cascade: settings.cascade,
        };
        let handle = MixEngineHandle {
            request_tx,
            reply_tx,
            request_gauge,
            reply_gauge,
        };
        Ok((engine, handle))
    }

    /// Drive both lanes until every handle is dropped and the final flushes
    /// are delivered. Each batch is handed to the sink whole before the
    /// next one is taken, so two releases never interleave.
    pub async fn run(self) {
        let Self {
            mut request_lane,
            mut reply_lane,
            mut output,
            cascade,
        } = self;
        // A lane propagates sizes when a successor exists in its direction.
        let request_propagates = !cascade.last_mix;
        let reply_propagates = !cascade.first_mix;
        let mut request_done = false;
        let mut reply_done = false;

        while !(request_done && reply_done) {
            tokio::select! {
                batch = request_lane.next(), if !request_done => match batch {
                    Some(batch) => deliver(&mut output, request_propagates, cascade.mix_sequence, batch),
                    None => request_done = true,
                },
                batch = reply_lane.next(), if !reply_done => match batch {
                    Some(batch) => deliver(&mut output, reply_propagates, cascade.mix_sequence, batch),
                    None => reply_done = true,
                },
            }
        }
    }
}

fn deliver<O: OutputSink>(
    output: &mut O,
    propagate: bool,
    mix_sequence: u32,
    batch: ReleaseBatch,
) {
    let direction = batch.direction;
    tracing::debug!(
        ?direction,
        count = batch.len(),
        trigger = ?batch.trigger,
        "releasing batch"
    );
    if propagate {
        output.announce_next(
            direction,
            BatchSizeAnnouncement {
                expected_count: batch.len(),
                from_mix_sequence: mix_sequence,
            },
        );
    }
    for packet in batch.packets {
        match direction {
            Direction::Request => output.put_out_request(packet),
            Direction::Reply => output.put_out_reply(packet),
        }
    }
}
