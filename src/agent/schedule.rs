//! Resumable jittered schedules.
//!
//! A schedule fires its callback after a delay drawn uniformly from a
//! `[lower, upper]` window, waits for the callback to finish, draws a new
//! delay and repeats until cancelled. The first delay can instead be the
//! time left over from an earlier, interrupted schedule so that stopping and
//! restarting a mode does not reset its clock.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;

/// Inclusive window a delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleBounds {
    lower: Duration,
    upper: Duration,
}

impl ScheduleBounds {
    pub fn new(lower: Duration, upper: Duration) -> Self {
        Self { lower, upper }
    }

    pub fn from_millis(lower_ms: u64, upper_ms: u64) -> Self {
        Self::new(Duration::from_millis(lower_ms), Duration::from_millis(upper_ms))
    }

    pub fn lower(&self) -> Duration {
        self.lower
    }

    pub fn upper(&self) -> Duration {
        self.upper
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.lower > self.upper {
            return Err(SchedulerError::InvalidBounds {
                lower_ms: self.lower.as_millis() as u64,
                upper_ms: self.upper.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// `lower + r * (upper - lower)` for an already validated window.
    fn sample(&self, r: f64) -> Duration {
        let r = if r.is_finite() { r.clamp(0.0, 1.0) } else { 0.0 };
        let span = self.upper.saturating_sub(self.lower).as_nanos() as f64;
        self.lower + Duration::from_nanos((span * r) as u64)
    }
}

/// Draw one delay from `bounds` using the unit sample `r` in `[0, 1)`.
pub fn draw_interval(bounds: &ScheduleBounds, r: f64) -> Result<Duration, SchedulerError> {
    bounds.validate()?;
    Ok(bounds.sample(r))
}

/// Source of uniform samples in `[0, 1)`.
pub trait JitterSource: Send + Sync {
    fn next_unit(&self) -> f64;
}

/// Default jitter backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn next_unit(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Snapshot of an armed timer, kept after a mode stops so it can resume.
#[derive(Debug, Clone, Copy)]
pub struct ResumePoint {
    pub interval: Duration,
    pub armed_at: Instant,
}

impl ResumePoint {
    /// Time still owed on the interrupted timer; zero when it is overdue.
    pub fn remaining(&self) -> Duration {
        self.interval.saturating_sub(self.armed_at.elapsed())
    }
}

#[derive(Debug)]
struct ArmState {
    interval: Duration,
    armed_at: Instant,
}

struct ScheduleShared {
    label: String,
    state: Mutex<ArmState>,
    fires: AtomicU64,
    registrations: AtomicU64,
    finished: AtomicBool,
    exited: Notify,
}

impl ScheduleShared {
    fn record_armed(&self, interval: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.interval = interval;
            state.armed_at = Instant::now();
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> ResumePoint {
        match self.state.lock() {
            Ok(state) => ResumePoint {
                interval: state.interval,
                armed_at: state.armed_at,
            },
            Err(poisoned) => {
                let state = poisoned.into_inner();
                ResumePoint {
                    interval: state.interval,
                    armed_at: state.armed_at,
                }
            }
        }
    }
}

/// Resolves once a schedule loop has exited, including any callback that
/// was running when it was cancelled.
#[derive(Clone)]
pub struct ScheduleDone {
    shared: Arc<ScheduleShared>,
}

impl ScheduleDone {
    pub fn is_done(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let exited = self.shared.exited.notified();
            if self.is_done() {
                return;
            }
            exited.await;
        }
    }
}

impl std::fmt::Debug for ScheduleDone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleDone")
            .field("label", &self.shared.label)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Handle to a running schedule.
///
/// Dropping the handle cancels the schedule. Cancellation only prevents the
/// next firing; a callback already running is left to finish.
pub struct ScheduleHandle {
    shared: Arc<ScheduleShared>,
    token: CancellationToken,
}

impl ScheduleHandle {
    /// Stop the pending timer. Safe to call any number of times.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(schedule = %self.shared.label, "Cancelling schedule");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the schedule loop is still alive (not cancelled and not exited).
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.shared.finished.load(Ordering::SeqCst)
    }

    /// Most recently drawn or assigned delay.
    pub fn current_interval(&self) -> Duration {
        self.shared.snapshot().interval
    }

    pub fn armed_at(&self) -> Instant {
        self.shared.snapshot().armed_at
    }

    /// Time until the pending firing, zero when it is due or running.
    pub fn remaining(&self) -> Duration {
        self.shared.snapshot().remaining()
    }

    pub fn resume_point(&self) -> ResumePoint {
        self.shared.snapshot()
    }

    /// Signal for the loop exiting; outlives the handle.
    pub fn done(&self) -> ScheduleDone {
        ScheduleDone {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of times the callback has been started.
    pub fn fire_count(&self) -> u64 {
        self.shared.fires.load(Ordering::SeqCst)
    }

    /// Number of timers armed so far, including the initial one.
    pub fn timer_registrations(&self) -> u64 {
        self.shared.registrations.load(Ordering::SeqCst)
    }
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for ScheduleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleHandle")
            .field("label", &self.shared.label)
            .field("current_interval", &self.current_interval())
            .field("fires", &self.fire_count())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Arms self-rescheduling timers.
#[derive(Clone)]
pub struct ResumableScheduler {
    jitter: Arc<dyn JitterSource>,
}

impl Default for ResumableScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumableScheduler {
    pub fn new() -> Self {
        Self {
            jitter: Arc::new(ThreadRngJitter),
        }
    }

    /// Use a custom random source (tests feed fixed samples).
    pub fn with_jitter(jitter: Arc<dyn JitterSource>) -> Self {
        Self { jitter }
    }

    /// Draw a delay from `bounds` using this scheduler's jitter source.
    pub fn draw(&self, bounds: &ScheduleBounds) -> Result<Duration, SchedulerError> {
        draw_interval(bounds, self.jitter.next_unit())
    }

    /// Start a schedule.
    ///
    /// With `resume = None` the first delay is drawn from `bounds`; with
    /// `Some(d)` the first firing happens after exactly `d` (zero fires on
    /// the next runtime tick). Every later delay is drawn fresh. Bounds are
    /// validated up front even when resuming.
    pub fn arm<F, Fut>(
        &self,
        label: impl Into<String>,
        bounds: ScheduleBounds,
        resume: Option<Duration>,
        mut callback: F,
    ) -> Result<ScheduleHandle, SchedulerError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        bounds.validate()?;
        let first = match resume {
            Some(remaining) => remaining,
            None => bounds.sample(self.jitter.next_unit()),
        };

        let shared = Arc::new(ScheduleShared {
            label: label.into(),
            state: Mutex::new(ArmState {
                interval: first,
                armed_at: Instant::now(),
            }),
            fires: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            exited: Notify::new(),
        });
        shared.record_armed(first);

        tracing::debug!(
            schedule = %shared.label,
            delay_ms = first.as_millis() as u64,
            resumed = resume.is_some(),
            "Schedule armed"
        );

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let loop_shared = Arc::clone(&shared);
        let jitter = Arc::clone(&self.jitter);

        tokio::spawn(async move {
            let mut delay = first;
            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                loop_shared.fires.fetch_add(1, Ordering::SeqCst);
                callback().await;

                if loop_token.is_cancelled() {
                    break;
                }

                delay = bounds.sample(jitter.next_unit());
                loop_shared.record_armed(delay);
                tracing::debug!(
                    schedule = %loop_shared.label,
                    delay_ms = delay.as_millis() as u64,
                    "Schedule re-armed"
                );
            }
            loop_shared.finished.store(true, Ordering::SeqCst);
            loop_shared.exited.notify_waiters();
            tracing::debug!(schedule = %loop_shared.label, "Schedule loop exited");
        });

        Ok(ScheduleHandle { shared, token })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc;

    use super::*;

    /// Replays a fixed list of samples, repeating the last one.
    struct FixedJitter(StdMutex<Vec<f64>>);

    impl FixedJitter {
        fn new(samples: &[f64]) -> Arc<Self> {
            let mut samples = samples.to_vec();
            samples.reverse();
            Arc::new(Self(StdMutex::new(samples)))
        }
    }

    impl JitterSource for FixedJitter {
        fn next_unit(&self) -> f64 {
            let mut samples = self.0.lock().unwrap();
            if samples.len() > 1 {
                samples.pop().unwrap()
            } else {
                samples.last().copied().unwrap_or(0.0)
            }
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn draw_is_linear_in_sample() {
        let bounds = ScheduleBounds::from_millis(1000, 2000);
        assert_eq!(draw_interval(&bounds, 0.5).unwrap(), ms(1500));
        assert_eq!(draw_interval(&bounds, 0.25).unwrap(), ms(1250));
        assert_eq!(draw_interval(&bounds, 0.75).unwrap(), ms(1750));
        assert_eq!(draw_interval(&bounds, 0.0).unwrap(), ms(1000));
    }

    #[test]
    fn inverted_bounds_rejected() {
        let err = draw_interval(&ScheduleBounds::from_millis(2000, 1000), 0.5).unwrap_err();
        assert!(
            err.to_string()
                .contains("Lower bound cannot be greater than upper bound")
        );
    }

    #[test]
    fn equal_bounds_draw_exact_value() {
        let bounds = ScheduleBounds::from_millis(1000, 1000);
        for r in [0.0, 0.3, 0.999] {
            assert_eq!(draw_interval(&bounds, r).unwrap(), ms(1000));
        }
    }

    #[test]
    fn thread_rng_draws_stay_in_window() {
        let scheduler = ResumableScheduler::new();
        let bounds = ScheduleBounds::from_millis(100, 200);
        for _ in 0..100 {
            let d = scheduler.draw(&bounds).unwrap();
            assert!(d >= ms(100) && d <= ms(200), "out of window: {d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn arm_rejects_inverted_bounds_even_when_resuming() {
        let scheduler = ResumableScheduler::new();
        let result = scheduler.arm(
            "bad",
            ScheduleBounds::from_millis(2000, 1000),
            Some(Duration::ZERO),
            || async {},
        );
        assert!(matches!(result, Err(SchedulerError::InvalidBounds { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_prevents_callback() {
        let scheduler = ResumableScheduler::with_jitter(FixedJitter::new(&[0.5]));
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let handle = scheduler
            .arm("cancel", ScheduleBounds::from_millis(1000, 2000), None, move || {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                }
            })
            .unwrap();
        assert_eq!(handle.current_interval(), ms(1500));

        handle.cancel();
        handle.cancel();
        tokio::time::sleep(ms(5000)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(handle.fire_count(), 0);
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_rearms_a_second_timer() {
        let scheduler = ResumableScheduler::with_jitter(FixedJitter::new(&[0.0]));
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let handle = scheduler
            .arm("rearm", ScheduleBounds::from_millis(1000, 1000), None, move || {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                }
            })
            .unwrap();
        assert_eq!(handle.timer_registrations(), 1);

        rx.recv().await.unwrap();
        tokio::time::sleep(ms(10)).await;

        assert_eq!(handle.fire_count(), 1);
        assert_eq!(handle.timer_registrations(), 2);
        assert_eq!(handle.current_interval(), ms(1000));
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn resume_uses_exact_remaining_then_draws_fresh() {
        let scheduler = ResumableScheduler::with_jitter(FixedJitter::new(&[0.5]));
        let start = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<Instant>();
        let handle = scheduler
            .arm(
                "resume",
                ScheduleBounds::from_millis(1000, 2000),
                Some(ms(300)),
                move || {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(Instant::now());
                    }
                },
            )
            .unwrap();
        assert_eq!(handle.current_interval(), ms(300));

        let first = rx.recv().await.unwrap();
        assert_eq!(first - start, ms(300));

        let second = rx.recv().await.unwrap();
        assert_eq!(second - first, ms(1500));
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn resume_zero_fires_immediately() {
        let scheduler = ResumableScheduler::with_jitter(FixedJitter::new(&[0.5]));
        let start = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<Instant>();
        let handle = scheduler
            .arm(
                "now",
                ScheduleBounds::from_millis(60_000, 120_000),
                Some(Duration::ZERO),
                move || {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(Instant::now());
                    }
                },
            )
            .unwrap();

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired - start, Duration::ZERO);
        tokio::time::sleep(ms(10)).await;
        assert_eq!(handle.current_interval(), ms(90_000));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_callback_lets_it_finish_but_stops_rearm() {
        let scheduler = ResumableScheduler::with_jitter(FixedJitter::new(&[0.0]));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let handle = scheduler
            .arm("slow", ScheduleBounds::from_millis(100, 100), None, move || {
                let started_tx = started_tx.clone();
                let done_tx = done_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(ms(1000)).await;
                    let _ = done_tx.send(());
                }
            })
            .unwrap();

        started_rx.recv().await.unwrap();
        handle.cancel();
        done_rx.recv().await.unwrap();
        tokio::time::sleep(ms(1000)).await;

        assert_eq!(handle.fire_count(), 1);
        assert_eq!(handle.timer_registrations(), 1);
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn done_waits_for_running_callback() {
        let scheduler = ResumableScheduler::with_jitter(FixedJitter::new(&[0.0]));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handle = scheduler
            .arm("drain", ScheduleBounds::from_millis(100, 100), Some(Duration::ZERO), move || {
                let started_tx = started_tx.clone();
                let flag = Arc::clone(&flag);
                async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(ms(5000)).await;
                    flag.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        started_rx.recv().await.unwrap();
        let done = handle.done();
        drop(handle);
        assert!(!done.is_done());

        let start = Instant::now();
        done.wait().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(start.elapsed() >= ms(5000));
        // Already exited: returns at once.
        done.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn done_resolves_when_cancelled_while_sleeping() {
        let scheduler = ResumableScheduler::new();
        let handle = scheduler
            .arm("idle", ScheduleBounds::from_millis(60_000, 60_000), None, || async {})
            .unwrap();
        let done = handle.done();
        handle.cancel();
        done.wait().await;
        assert_eq!(handle.fire_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_point_remaining_saturates() {
        let point = ResumePoint {
            interval: ms(500),
            armed_at: Instant::now(),
        };
        tokio::time::advance(ms(200)).await;
        assert_eq!(point.remaining(), ms(300));
        tokio::time::advance(ms(1000)).await;
        assert_eq!(point.remaining(), Duration::ZERO);
    }
}
