//! Keeper poll engine: a flat retry-until-timeout loop and the poll-until-state
//! engine built on the same backoff. Both wait for a remote condition within a
//! fixed time budget; neither spawns tasks.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use keeper_core::{classify, Classification, Classify, ForbiddenPolicy};
use metrics::counter;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

fn env_millis(key: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default_ms);
    Duration::from_millis(ms)
}

/// Pacing of a wait loop. The overall budget is passed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// First gap between attempts; gaps double from here. Values below
    /// [`MIN_INTERVAL_FLOOR`] are raised to it.
    pub min_interval: Duration,
    /// Upper bound for the gap between attempts.
    pub max_interval: Duration,
    /// Wait before the first attempt (eases back-to-back calls on rate-limited backends).
    pub initial_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(10),
            initial_delay: Duration::from_secs(3),
        }
    }
}

impl PollConfig {
    /// Defaults overridable via `KEEPER_POLL_MIN_INTERVAL_MS`,
    /// `KEEPER_POLL_MAX_INTERVAL_MS` and `KEEPER_POLL_INITIAL_DELAY_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_interval: env_millis("KEEPER_POLL_MIN_INTERVAL_MS", d.min_interval.as_millis() as u64),
            max_interval: env_millis("KEEPER_POLL_MAX_INTERVAL_MS", d.max_interval.as_millis() as u64),
            initial_delay: env_millis("KEEPER_POLL_INITIAL_DELAY_MS", d.initial_delay.as_millis() as u64),
        }
    }

    pub fn without_initial_delay(self) -> Self {
        Self { initial_delay: Duration::ZERO, ..self }
    }
}

/// Smallest gap between attempts, whatever the configuration says.
pub const MIN_INTERVAL_FLOOR: Duration = Duration::from_millis(100);

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deadline and gap bookkeeping shared by both loops.
struct Backoff {
    started: Instant,
    deadline: Instant,
    min_interval: Duration,
    interval: Duration,
    max_interval: Duration,
    attempts: u32,
}

impl Backoff {
    async fn start(timeout: Duration, cfg: &PollConfig) -> Self {
        let started = Instant::now();
        let deadline = started.checked_add(timeout).unwrap_or_else(|| started + FAR_FUTURE);
        if !cfg.initial_delay.is_zero() {
            sleep(cfg.initial_delay.min(deadline - started)).await;
        }
        let min_interval = cfg.min_interval.max(MIN_INTERVAL_FLOOR);
        Self {
            started,
            deadline,
            min_interval,
            interval: min_interval,
            max_interval: cfg.max_interval.max(min_interval),
            attempts: 0,
        }
    }

    fn record_attempt(&mut self) {
        self.attempts += 1;
        counter!("keeper_poll_attempts", 1u64);
    }

    /// Sleep before the next attempt. Returns false once the budget left is
    /// shorter than the minimum gap; a final gap may be cut down to the
    /// deadline but never below the minimum.
    async fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let remaining = self.deadline - now;
        if remaining < self.min_interval {
            return false;
        }
        sleep(self.interval.min(remaining)).await;
        self.interval = self.interval.saturating_mul(2).min(self.max_interval);
        true
    }

    fn elapsed(&self) -> Duration { self.started.elapsed() }
}

/// Outcome of one flat-retry attempt that did not succeed.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Not there yet; the string describes what was observed.
    Retry(String),
    /// Stop immediately and surface the error.
    Abort(E),
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {elapsed:?} ({attempts} attempts), last: {last}")]
    Timeout { elapsed: Duration, attempts: u32, last: String },
    #[error("{0}")]
    Aborted(E),
}

/// Repeat `attempt` until it succeeds, aborts, or `timeout` elapses.
pub async fn retry<T, E, F, Fut>(timeout: Duration, cfg: &PollConfig, mut attempt: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let mut backoff = Backoff::start(timeout, cfg).await;
    loop {
        backoff.record_attempt();
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(Attempt::Abort(e)) => return Err(RetryError::Aborted(e)),
            Err(Attempt::Retry(last)) => {
                debug!(attempt = backoff.attempts, last = %last, "retrying");
                if !backoff.wait().await {
                    counter!("keeper_poll_timeouts", 1u64);
                    return Err(RetryError::Timeout { elapsed: backoff.elapsed(), attempts: backoff.attempts, last });
                }
            }
        }
    }
}

/// A set of state labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateSet {
    /// Every observed label belongs to the set.
    Any,
    Only(Vec<String>),
}

impl StateSet {
    pub fn of(labels: &[&str]) -> Self { StateSet::Only(labels.iter().map(|s| s.to_string()).collect()) }

    pub fn none() -> Self { StateSet::Only(Vec::new()) }

    pub fn contains(&self, label: &str) -> bool {
        match self {
            StateSet::Any => true,
            StateSet::Only(v) => v.iter().any(|l| l == label),
        }
    }
}

impl fmt::Display for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateSet::Any => f.write_str("*"),
            StateSet::Only(v) => f.write_str(&v.join(", ")),
        }
    }
}

/// Meaning of a not-found probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnNotFound {
    /// Waiting for deletion: the resource is gone, which is success.
    Converged,
    /// Waiting for creation: the resource never appeared.
    Fail,
}

/// Condition a poll waits for.
#[derive(Debug, Clone)]
pub struct StateWait {
    pub pending: StateSet,
    pub target: StateSet,
    pub on_not_found: OnNotFound,
    pub forbidden: ForbiddenPolicy,
}

impl StateWait {
    /// Wait until one of `target` while any of `pending` is observed.
    pub fn until(pending: &[&str], target: &[&str]) -> Self {
        Self {
            pending: StateSet::of(pending),
            target: StateSet::of(target),
            on_not_found: OnNotFound::Fail,
            forbidden: ForbiddenPolicy::default(),
        }
    }

    /// Wait until the probe reports not-found, whatever state is observed meanwhile.
    pub fn until_gone() -> Self {
        Self {
            pending: StateSet::Any,
            target: StateSet::none(),
            on_not_found: OnNotFound::Converged,
            forbidden: ForbiddenPolicy::default(),
        }
    }

    pub fn with_forbidden_policy(mut self, policy: ForbiddenPolicy) -> Self {
        self.forbidden = policy;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    /// The probe failed with a non-retryable error.
    #[error("{0}")]
    Remote(E),
    #[error("resource not found while waiting for it to appear")]
    Vanished,
    #[error("unexpected state '{state}' (expected one of: {expected})")]
    UnexpectedState { state: String, expected: String },
    #[error("timed out after {elapsed:?}, last observed state '{last_state}'")]
    Timeout { elapsed: Duration, last_state: String },
}

/// Poll `probe` until its state label reaches `wait.target`.
///
/// Returns `Some(observation)` on reaching the target and `None` when the
/// resource is confirmed gone under [`OnNotFound::Converged`].
pub async fn poll_until<T, E, F, Fut>(
    wait: &StateWait,
    timeout: Duration,
    cfg: &PollConfig,
    mut probe: F,
) -> Result<Option<T>, PollError<E>>
where
    E: Classify + fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(T, String), E>>,
{
    let mut backoff = Backoff::start(timeout, cfg).await;
    let mut last_state: Option<String> = None;
    let mut last_error: Option<String> = None;
    loop {
        backoff.record_attempt();
        match probe().await {
            Ok((obs, state)) => {
                if wait.target.contains(&state) {
                    debug!(state = %state, attempts = backoff.attempts, "target state reached");
                    return Ok(Some(obs));
                }
                if !wait.pending.contains(&state) {
                    warn!(state = %state, pending = %wait.pending, target = %wait.target, "unexpected state");
                    let expected = match (&wait.pending, &wait.target) {
                        (StateSet::Only(p), StateSet::Only(t)) => p.iter().chain(t.iter()).cloned().collect::<Vec<_>>().join(", "),
                        _ => format!("{}; {}", wait.pending, wait.target),
                    };
                    return Err(PollError::UnexpectedState { state, expected });
                }
                debug!(state = %state, attempt = backoff.attempts, "still pending");
                last_state = Some(state);
            }
            Err(err) => match classify(&err, wait.forbidden) {
                Classification::NotFound => {
                    return match wait.on_not_found {
                        OnNotFound::Converged => {
                            debug!(attempts = backoff.attempts, "resource gone");
                            Ok(None)
                        }
                        OnNotFound::Fail => Err(PollError::Vanished),
                    };
                }
                Classification::Retryable => {
                    counter!("keeper_retry_transient", 1u64);
                    warn!(error = %err, attempt = backoff.attempts, "transient probe failure; retrying");
                    last_error = Some(err.to_string());
                }
                Classification::NonRetryable => return Err(PollError::Remote(err)),
            },
        }
        if !backoff.wait().await {
            counter!("keeper_poll_timeouts", 1u64);
            let last_state = match (last_state, last_error) {
                (Some(s), _) => s,
                (None, Some(e)) => format!("unobserved (last error: {})", e),
                (None, None) => "unobserved".to_string(),
            };
            return Err(PollError::Timeout { elapsed: backoff.elapsed(), last_state });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_core::RemoteError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast() -> PollConfig {
        PollConfig {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(4),
            initial_delay: Duration::from_secs(2),
        }
    }

    type Step = Result<((), String), RemoteError>;

    fn state(s: &str) -> Step { Ok(((), s.to_string())) }

    /// Probe over a script; the last step repeats forever.
    fn scripted(steps: Vec<Step>) -> (impl FnMut() -> std::future::Ready<Step>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let script = Arc::new(Mutex::new(VecDeque::from(steps)));
        let probe = move || {
            c.fetch_add(1, Ordering::SeqCst);
            let mut s = script.lock().unwrap();
            let step = if s.len() > 1 { s.pop_front().unwrap() } else { s.front().cloned().unwrap() };
            std::future::ready(step)
        };
        (probe, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn converges_on_first_target_observation() {
        let (probe, calls) = scripted(vec![state("Inactive"), state("Inactive"), state("Active")]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        let out = poll_until(&wait, Duration::from_secs(60), &fast(), probe).await.unwrap();
        assert!(out.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_precedes_first_probe() {
        let t0 = Instant::now();
        let (probe, _) = scripted(vec![state("Active")]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        poll_until(&wait, Duration::from_secs(60), &fast(), probe).await.unwrap();
        assert!(t0.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_pending_times_out_with_last_state() {
        let t0 = Instant::now();
        let (probe, calls) = scripted(vec![state("Inactive")]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        let err = poll_until(&wait, Duration::from_secs(30), &fast(), probe).await.unwrap_err();
        match err {
            PollError::Timeout { elapsed, last_state } => {
                assert!(elapsed >= Duration::from_secs(30));
                assert_eq!(last_state, "Inactive");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(t0.elapsed() < Duration::from_secs(31));
        assert!(calls.load(Ordering::SeqCst) > 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_state_aborts_instead_of_spinning() {
        let (probe, calls) = scripted(vec![state("Inactive"), state("Exploding")]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        let err = poll_until(&wait, Duration::from_secs(60), &fast(), probe).await.unwrap_err();
        match err {
            PollError::UnexpectedState { state, expected } => {
                assert_eq!(state, "Exploding");
                assert_eq!(expected, "Inactive, Active");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_converges_when_waiting_for_deletion() {
        let (probe, calls) = scripted(vec![state("Active"), state("Terminating"), Err(RemoteError::not_found())]);
        let out = poll_until(&StateWait::until_gone(), Duration::from_secs(60), &fast(), probe).await.unwrap();
        assert!(out.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_behaves_like_not_found() {
        let (probe, _) = scripted(vec![state("Active"), Err(RemoteError::forbidden())]);
        let out = poll_until(&StateWait::until_gone(), Duration::from_secs(60), &fast(), probe).await.unwrap();
        assert!(out.is_none());

        let (probe, _) = scripted(vec![Err(RemoteError::forbidden())]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        let err = poll_until(&wait, Duration::from_secs(60), &fast(), probe).await.unwrap_err();
        assert!(matches!(err, PollError::Vanished));
    }

    #[tokio::test(start_paused = true)]
    async fn surfaced_forbidden_aborts() {
        let (probe, _) = scripted(vec![Err(RemoteError::forbidden())]);
        let wait = StateWait::until_gone().with_forbidden_policy(ForbiddenPolicy::Surface);
        let err = poll_until(&wait, Duration::from_secs(60), &fast(), probe).await.unwrap_err();
        assert!(matches!(err, PollError::Remote(RemoteError::Status { code: 403, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_fails_when_waiting_for_creation() {
        let (probe, _) = scripted(vec![state("Inactive"), Err(RemoteError::not_found())]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        let err = poll_until(&wait, Duration::from_secs(60), &fast(), probe).await.unwrap_err();
        assert!(matches!(err, PollError::Vanished));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_absorbed() {
        let (probe, calls) = scripted(vec![Err(RemoteError::timeout("i/o timeout")), state("Active")]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        assert!(poll_until(&wait, Duration::from_secs(60), &fast(), probe).await.unwrap().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_aborts_immediately() {
        let (probe, calls) = scripted(vec![Err(RemoteError::status(401, "unauthorized")), state("Active")]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        let err = poll_until(&wait, Duration::from_secs(60), &fast(), probe).await.unwrap_err();
        assert!(matches!(err, PollError::Remote(RemoteError::Status { code: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_observation_reports_last_error() {
        let (probe, _) = scripted(vec![Err(RemoteError::connect("connection refused"))]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        let err = poll_until(&wait, Duration::from_secs(10), &fast(), probe).await.unwrap_err();
        match err {
            PollError::Timeout { last_state, .. } => assert!(last_state.contains("connection refused"), "{}", last_state),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gaps_grow_but_stay_capped() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let s = stamps.clone();
        let cfg = fast().without_initial_delay();
        let res: Result<(), RetryError<()>> = retry(Duration::from_secs(20), &cfg, || {
            s.lock().unwrap().push(Instant::now());
            async { Err(Attempt::Retry("Inactive".to_string())) }
        })
        .await;
        assert!(matches!(res, Err(RetryError::Timeout { .. })));
        let stamps = stamps.lock().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(&gaps[..4], &[Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(4)]);
        assert!(gaps.iter().all(|g| *g <= Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_abort_stops_loop() {
        let n = Arc::new(AtomicUsize::new(0));
        let c = n.clone();
        let res: Result<(), RetryError<&str>> = retry(Duration::from_secs(20), &fast(), || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(Attempt::Abort("conflict")) }
        })
        .await;
        assert!(matches!(res, Err(RetryError::Aborted("conflict"))));
        assert_eq!(n.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_does_not_overflow() {
        let n = Arc::new(AtomicUsize::new(0));
        let c = n.clone();
        let res: Result<u32, RetryError<()>> = retry(Duration::MAX, &fast(), || {
            let k = c.fetch_add(1, Ordering::SeqCst);
            async move { if k == 0 { Err(Attempt::Retry("pending".to_string())) } else { Ok(7) } }
        })
        .await;
        assert_eq!(res.unwrap(), 7);

        let (probe, _) = scripted(vec![state("Inactive"), state("Active")]);
        let wait = StateWait::until(&["Inactive"], &["Active"]);
        assert!(poll_until(&wait, Duration::MAX, &fast(), probe).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_intervals_are_floored() {
        let n = Arc::new(AtomicUsize::new(0));
        let c = n.clone();
        let cfg = PollConfig { min_interval: Duration::ZERO, max_interval: Duration::ZERO, initial_delay: Duration::ZERO };
        let res: Result<(), RetryError<()>> = retry(Duration::from_secs(1), &cfg, || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(Attempt::Retry("Terminating".to_string())) }
        })
        .await;
        assert!(matches!(res, Err(RetryError::Timeout { .. })));
        // 0, 100, 300, 700 and 1000 ms
        assert_eq!(n.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn final_gap_never_below_minimum() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let s = stamps.clone();
        let cfg = PollConfig {
            min_interval: Duration::from_secs(4),
            max_interval: Duration::from_secs(4),
            initial_delay: Duration::ZERO,
        };
        let res: Result<(), RetryError<()>> = retry(Duration::from_secs(10), &cfg, || {
            s.lock().unwrap().push(Instant::now());
            async { Err(Attempt::Retry("Inactive".to_string())) }
        })
        .await;
        match res {
            Err(RetryError::Timeout { attempts, elapsed, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(elapsed, Duration::from_secs(8));
            }
            other => panic!("unexpected: {other:?}"),
        }
        let stamps = stamps.lock().unwrap();
        assert!(stamps.windows(2).all(|w| w[1] - w[0] == Duration::from_secs(4)));
    }

    #[test]
    fn env_overrides_fall_back_to_defaults() {
        std::env::set_var("KEEPER_POLL_MIN_INTERVAL_MS", "250");
        std::env::set_var("KEEPER_POLL_MAX_INTERVAL_MS", "not-a-number");
        let cfg = PollConfig::from_env();
        assert_eq!(cfg.min_interval, Duration::from_millis(250));
        assert_eq!(cfg.max_interval, Duration::from_secs(10));
        std::env::remove_var("KEEPER_POLL_MIN_INTERVAL_MS");
        std::env::remove_var("KEEPER_POLL_MAX_INTERVAL_MS");
    }
}
