use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{self, Instant, Sleep};

/// One-shot timer with replace-on-arm semantics.
///
/// Arming replaces any previously armed deadline, so a policy can never
/// stack duplicate timers for the same store. `cancel` is idempotent;
/// canceling an unarmed or already-fired timer is a no-op.
#[derive(Default)]
pub struct OneShot {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl OneShot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, delay: Duration) {
        self.sleep = Some(Box::pin(time::sleep(delay)));
    }

    pub fn arm_until(&mut self, deadline: Instant) {
        self.sleep = Some(Box::pin(time::sleep_until(deadline)));
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Ready exactly once per armed deadline; the timer disarms on fire.
    pub fn poll_fired(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(sleep) = self.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                self.sleep = None;
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }
}

/// Periodic tick for timeout-driven policies.
///
/// Each tick reports the real firing time. A tick that lands later than the
/// drift tolerance is logged as a warning and still proceeds; downstream
/// timing decisions use the actual instant, not the nominal schedule.
pub struct FireInterval {
    interval: time::Interval,
    period: Duration,
    tolerance: Duration,
}

impl FireInterval {
    /// First tick one full period from now, then every period.
    /// The default drift tolerance is a tenth of the period.
    pub fn new(period: Duration) -> Self {
        Self::with_tolerance(period, period / 10)
    }

    pub fn with_tolerance(period: Duration, tolerance: Duration) -> Self {
        Self {
            interval: time::interval_at(Instant::now() + period, period),
            period,
            tolerance,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn poll_tick(&mut self, cx: &mut Context<'_>) -> Poll<Instant> {
        match self.interval.poll_tick(cx) {
            Poll::Ready(deadline) => {
                let now = Instant::now();
                let late = now.saturating_duration_since(deadline);
                if late > self.tolerance {
                    tracing::warn!(
                        late_ms = late.as_millis() as u64,
                        period_ms = self.period.as_millis() as u64,
                        "release tick fired beyond drift tolerance"
                    );
                }
                Poll::Ready(now)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once_and_disarms() {
        let mut timer = OneShot::new();
        timer.arm(Duration::from_millis(50));
        assert!(timer.is_armed());
        poll_fn(|cx| timer.poll_fired(cx)).await;
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn arming_replaces_previous_deadline() {
        let mut timer = OneShot::new();
        timer.arm(Duration::from_millis(10));
        timer.arm(Duration::from_millis(100));
        let started = Instant::now();
        poll_fn(|cx| timer.poll_fired(cx)).await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let mut timer = OneShot::new();
        timer.cancel();
        timer.arm(Duration::from_millis(10));
        timer.cancel();
        timer.cancel();
        assert!(!timer.is_armed());
        let fired = poll_fn(|cx| Poll::Ready(timer.poll_fired(cx).is_ready())).await;
        assert!(!fired);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticks_every_period() {
        let mut interval = FireInterval::new(Duration::from_millis(100));
        let started = Instant::now();
        poll_fn(|cx| interval.poll_tick(cx)).await;
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        poll_fn(|cx| interval.poll_tick(cx)).await;
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }
}
