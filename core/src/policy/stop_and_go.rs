use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::task::{Context, Poll};
use std::time::Duration;

use mixcade_message::{Direction, MixPacket};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::ReleasePolicy;
use crate::timer::OneShot;
use crate::{ReleaseBatch, TriggerReason};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StopAndGoSettings {
    /// Rate of the exponential delay distribution, events per minute.
    pub rate_per_min: f64,
}

/// Stop-and-go mix: every packet gets its own exponentially distributed
/// delay, drawn at admission, and leaves alone when its deadline passes.
/// There is no batch at all; unlinkability comes from the per-packet jitter.
pub struct StopAndGo {
    direction: Direction,
    delay: Exp<f64>,
    rng: ChaCha12Rng,
    queue: BinaryHeap<Scheduled>,
    next_seq: u64,
    timer: OneShot,
}

/// Min-heap entry ordered by deadline, then admission order.
struct Scheduled {
    release_at: tokio::time::Instant,
    seq: u64,
    packet: MixPacket,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        other
            .release_at
            .cmp(&self.release_at)
            .then(other.seq.cmp(&self.seq))
    }
}

impl StopAndGo {
    pub fn new(settings: StopAndGoSettings, direction: Direction) -> Result<Self, Error> {
        Self::with_rng(settings, direction, ChaCha12Rng::from_entropy())
    }

    fn with_rng(
        settings: StopAndGoSettings,
        direction: Direction,
        rng: ChaCha12Rng,
    ) -> Result<Self, Error> {
        // Exp::new accepts a zero rate, which would sample infinite delays;
        // reject anything that is not a positive finite rate up front.
        if !settings.rate_per_min.is_finite() || settings.rate_per_min <= 0.0 {
            return Err(Error::InvalidSendingRate);
        }
        Ok(Self {
            direction,
            delay: Exp::new(settings.rate_per_min)?,
            rng,
            queue: BinaryHeap::new(),
            next_seq: 0,
            timer: OneShot::new(),
        })
    }

    fn rearm(&mut self) {
        match self.queue.peek() {
            Some(earliest) => self.timer.arm_until(earliest.release_at),
            None => self.timer.cancel(),
        }
    }
}

impl ReleasePolicy for StopAndGo {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        let delay_min = self.delay.sample(&mut self.rng);
        let release_at =
            tokio::time::Instant::now() + Duration::from_secs_f64(delay_min * 60.0);
        self.queue.push(Scheduled {
            release_at,
            seq: self.next_seq,
            packet,
        });
        self.next_seq += 1;
        self.rearm();
    }

    fn poll_release(&mut self, cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        while self.timer.poll_fired(cx).is_ready() {
            let now = tokio::time::Instant::now();
            let due = self
                .queue
                .peek()
                .map_or(false, |earliest| earliest.release_at <= now);
            if due {
                if let Some(scheduled) = self.queue.pop() {
                    self.rearm();
                    return Poll::Ready(ReleaseBatch {
                        direction: self.direction,
                        trigger: TriggerReason::Timeout,
                        packets: vec![scheduled.packet],
                    });
                }
            }
            self.rearm();
        }
        Poll::Pending
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn drain_remaining(&mut self) -> Vec<MixPacket> {
        self.timer.cancel();
        let mut scheduled: Vec<Scheduled> = std::mem::take(&mut self.queue).into_vec();
        scheduled.sort_by(|a, b| a.release_at.cmp(&b.release_at).then(a.seq.cmp(&b.seq)));
        scheduled.into_iter().map(|s| s.packet).collect()
    }
}
