//! Pool mixes: admission never releases; a periodic tick releases a random
//! subset and leaves the rest in the pool.
//!
//! All variants share two invariants. No packet is ever discarded, and the
//! chance of leaving the pool in a given tick never decreases as the pool
//! grows, so a packet that keeps losing the draw becomes ever more likely
//! to go out (the starvation bound).

use std::f64::consts::SQRT_2;
use std::task::{Context, Poll};
use std::time::Duration;

use mixcade_message::{Direction, MixPacket};
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::ReleasePolicy;
use crate::store::SimplexStore;
use crate::timer::FireInterval;
use crate::{ReleaseBatch, TriggerReason};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BinomialPoolSettings {
    /// Interval between release lotteries.
    pub sending_rate: Duration,
    /// Center of the normal-CDF bias over the pool size.
    pub mean: f64,
    /// Spread of the normal-CDF bias.
    pub stddev: f64,
    /// Upper bound on the per-packet release probability, in (0, 1].
    pub max_output_fraction: f64,
}

/// Binomial pool: every `sending_rate`, each pooled packet independently
/// wins release with probability `Φ((size − mean) / stddev) ·
/// max_output_fraction`. Winners leave in sort-key order; losers stay.
pub struct BinomialPool {
    settings: BinomialPoolSettings,
    direction: Direction,
    store: SimplexStore,
    interval: FireInterval,
    uniform: Uniform<f64>,
    rng: ChaCha12Rng,
}

impl BinomialPool {
    pub fn new(settings: BinomialPoolSettings, direction: Direction) -> Result<Self, Error> {
        Self::with_rng(settings, direction, ChaCha12Rng::from_entropy())
    }

    fn with_rng(
        settings: BinomialPoolSettings,
        direction: Direction,
        rng: ChaCha12Rng,
    ) -> Result<Self, Error> {
        if settings.sending_rate.is_zero() {
            return Err(Error::InvalidSendingRate);
        }
        if settings.stddev <= 0.0 {
            return Err(Error::InvalidStddev);
        }
        validate_fraction(settings.max_output_fraction)?;
        Ok(Self {
            settings,
            direction,
            store: SimplexStore::new(),
            interval: FireInterval::new(settings.sending_rate),
            uniform: Uniform::from(0.0..1.0),
            rng,
        })
    }
}

impl ReleasePolicy for BinomialPool {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        self.store.add(packet);
    }

    fn poll_release(&mut self, cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        while self.interval.poll_tick(cx).is_ready() {
            let bias = normal_cdf(
                self.store.len() as f64,
                self.settings.mean,
                self.settings.stddev,
            ) * self.settings.max_output_fraction;
            let uniform = self.uniform;
            let rng = &mut self.rng;
            let winners = self.store.drain_where(|_| uniform.sample(rng) < bias);
            if !winners.is_empty() {
                return Poll::Ready(ReleaseBatch {
                    direction: self.direction,
                    trigger: TriggerReason::Probabilistic,
                    packets: winners,
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

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CottrellPoolSettings {
    /// Interval between release rounds.
    pub sending_rate: Duration,
    /// Packets always left behind to mix with the next round.
    pub pool_min: usize,
    /// Cap on the released share of the pool, in (0, 1].
    pub max_output_fraction: f64,
}

/// Timed dynamic pool: every round, release a uniformly chosen
/// `min(size − pool_min, ceil(size · max_output_fraction))` packets,
/// keeping at least `pool_min` behind.
pub struct CottrellPool {
    settings: CottrellPoolSettings,
    direction: Direction,
    store: SimplexStore,
    interval: FireInterval,
    rng: ChaCha12Rng,
}

impl CottrellPool {
    pub fn new(settings: CottrellPoolSettings, direction: Direction) -> Result<Self, Error> {
        Self::with_rng(settings, direction, ChaCha12Rng::from_entropy())
    }

    fn with_rng(
        settings: CottrellPoolSettings,
        direction: Direction,
        rng: ChaCha12Rng,
    ) -> Result<Self, Error> {
        if settings.sending_rate.is_zero() {
            return Err(Error::InvalidSendingRate);
        }
        validate_fraction(settings.max_output_fraction)?;
        Ok(Self {
            settings,
            direction,
            store: SimplexStore::new(),
            interval: FireInterval::new(settings.sending_rate),
            rng,
        })
    }
}

impl ReleasePolicy for CottrellPool {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        self.store.add(packet);
    }

    fn poll_release(&mut self, cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        while self.interval.poll_tick(cx).is_ready() {
            let size = self.store.len();
            if size <= self.settings.pool_min {
                continue;
            }
            let cap = (size as f64 * self.settings.max_output_fraction).ceil() as usize;
            let count = (size - self.settings.pool_min).min(cap);
            let released = self.store.drain_random(count, &mut self.rng);
            if !released.is_empty() {
                return Poll::Ready(ReleaseBatch {
                    direction: self.direction,
                    trigger: TriggerReason::Probabilistic,
                    packets: released,
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

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ThresholdPoolSettings {
    /// Interval between release checks.
    pub sending_rate: Duration,
    /// Pool size a tick must reach before anything is released.
    pub threshold: usize,
    /// Packets always left behind; must be below the threshold.
    pub pool_min: usize,
}

/// Threshold pool: a tick releases only once the pool holds at least
/// `threshold` packets, and then puts out `size − pool_min` of them,
/// uniformly chosen.
pub struct ThresholdPool {
    settings: ThresholdPoolSettings,
    direction: Direction,
    store: SimplexStore,
    interval: FireInterval,
    rng: ChaCha12Rng,
}

impl ThresholdPool {
    pub fn new(settings: ThresholdPoolSettings, direction: Direction) -> Result<Self, Error> {
        Self::with_rng(settings, direction, ChaCha12Rng::from_entropy())
    }

    fn with_rng(
        settings: ThresholdPoolSettings,
        direction: Direction,
        rng: ChaCha12Rng,
    ) -> Result<Self, Error> {
        if settings.sending_rate.is_zero() {
            return Err(Error::InvalidSendingRate);
        }
        if settings.threshold < 1 {
            return Err(Error::InvalidBatchSize);
        }
        if settings.pool_min >= settings.threshold {
            return Err(Error::InvalidPoolMin {
                pool_min: settings.pool_min,
                threshold: settings.threshold,
            });
        }
        Ok(Self {
            settings,
            direction,
            store: SimplexStore::new(),
            interval: FireInterval::new(settings.sending_rate),
            rng,
        })
    }
}

impl ReleasePolicy for ThresholdPool {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn on_packet(&mut self, packet: MixPacket) {
        self.store.add(packet);
    }

    fn poll_release(&mut self, cx: &mut Context<'_>) -> Poll<ReleaseBatch> {
        while self.interval.poll_tick(cx).is_ready() {
            let size = self.store.len();
            if size < self.settings.threshold {
                continue;
            }
            let count = size - self.settings.pool_min;
            let released = self.store.drain_random(count, &mut self.rng);
            if !released.is_empty() {
                return Poll::Ready(ReleaseBatch {
                    direction: self.direction,
                    trigger: TriggerReason::Probabilistic,
                    packets: released,
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

fn validate_fraction(fraction: f64) -> Result<(), Error> {
    if fraction > 0.0 && fraction <= 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidProbability(fraction))
    }
}

/// Standard normal CDF scaled to the given mean and deviation.
fn normal_cdf(x: f64, mean: f64, stddev: f64) -> f64 {
    0.5 * (1.0 + erf((x - mean) / (stddev * SQRT_2)))
}

/// Abramowitz & Stegun 7.1.26, max absolute error 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let polynomial = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - polynomial * (-x * x).exp())
}
