//! Restart policy evaluation with exponential backoff.
//!
//! A [`RestartManager`] belongs to one container. After each exit it decides
//! whether the policy asks for a restart and, if so, hands out a
//! [`RestartTimer`]. The timer resolves exactly once, either by firing or by
//! being cancelled, so a stop that wins the race always leaves the container
//! stopped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use harbord_common::config::BackoffConfig;
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::{RestartPolicy, RestartPolicyMode};
use tokio::sync::Notify;

/// The pending restart was cancelled before its timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("restart canceled")]
pub struct RestartCanceled;

#[derive(Debug)]
struct Inner {
    policy: RestartPolicy,
    restart_count: u32,
    delay: Duration,
    active: bool,
    canceled: bool,
    pending: Option<Arc<TimerShared>>,
}

/// Per-container restart decision maker.
#[derive(Debug)]
pub struct RestartManager {
    inner: Arc<Mutex<Inner>>,
    backoff: BackoffConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RestartManager {
    /// Creates a manager for `policy`, continuing from `restart_count`.
    #[must_use]
    pub fn new(policy: RestartPolicy, restart_count: u32, backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                policy,
                restart_count,
                delay: Duration::ZERO,
                active: false,
                canceled: false,
                pending: None,
            })),
            backoff,
        }
    }

    /// Replaces the policy used for future decisions.
    pub fn set_policy(&self, policy: RestartPolicy) {
        lock(&self.inner).policy = policy;
    }

    /// Current policy.
    #[must_use]
    pub fn policy(&self) -> RestartPolicy {
        lock(&self.inner).policy
    }

    /// Number of policy restarts issued so far.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        lock(&self.inner).restart_count
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        lock(&self.inner).canceled
    }

    /// Decides whether an exit should be followed by a restart.
    ///
    /// `run_duration` is how long the exited task ran; a run of at least the
    /// configured reset period returns the backoff to its base delay.
    ///
    /// Returns `Ok(None)` when the policy says no. On `Ok(Some(timer))` the
    /// restart counter has been incremented and the caller must wait on the
    /// timer before starting the container again.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a previous restart of this container is still
    /// pending. Callers treat any error as "do not restart".
    pub fn should_restart(
        &self,
        exit_code: i32,
        manually_stopped: bool,
        run_duration: Duration,
    ) -> Result<Option<RestartTimer>> {
        let mut inner = lock(&self.inner);
        if inner.policy.is_none() || inner.canceled {
            return Ok(None);
        }
        if inner.active {
            return Err(HarbordError::conflict(
                "invalid call on an active restart manager",
            ));
        }

        if run_duration >= self.backoff.reset_after() {
            inner.delay = Duration::ZERO;
        }
        inner.delay = if inner.delay.is_zero() {
            self.backoff.base_delay()
        } else {
            inner.delay.saturating_mul(2).min(self.backoff.max_delay())
        };

        if !policy_allows(inner.policy, inner.restart_count, exit_code, manually_stopped) {
            inner.active = false;
            return Ok(None);
        }

        inner.restart_count += 1;
        inner.active = true;
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::Pending),
            notify: Notify::new(),
        });
        inner.pending = Some(Arc::clone(&shared));
        tracing::debug!(
            delay_ms = u64::try_from(inner.delay.as_millis()).unwrap_or(u64::MAX),
            restart_count = inner.restart_count,
            "restart scheduled"
        );
        Ok(Some(RestartTimer {
            delay: inner.delay,
            shared,
            manager: Arc::clone(&self.inner),
        }))
    }

    /// Answers the same question as [`should_restart`](Self::should_restart)
    /// without scheduling anything or touching the counter and backoff.
    #[must_use]
    pub fn would_restart(&self, exit_code: i32, manually_stopped: bool) -> bool {
        let inner = lock(&self.inner);
        !inner.canceled
            && !inner.active
            && policy_allows(inner.policy, inner.restart_count, exit_code, manually_stopped)
    }

    /// Cancels the manager and any pending restart.
    ///
    /// After cancellation the manager never restarts again; a fresh manager
    /// is created on the next explicit start.
    pub fn cancel(&self) {
        let pending = {
            let mut inner = lock(&self.inner);
            inner.canceled = true;
            inner.pending.take()
        };
        if let Some(shared) = pending {
            let _ = shared.cancel();
        }
    }
}

fn policy_allows(
    policy: RestartPolicy,
    restart_count: u32,
    exit_code: i32,
    manually_stopped: bool,
) -> bool {
    match policy.name {
        RestartPolicyMode::No => false,
        RestartPolicyMode::Always | RestartPolicyMode::UnlessStopped => !manually_stopped,
        RestartPolicyMode::OnFailure => {
            let max = policy.maximum_retry_count;
            (max == 0 || restart_count < max) && exit_code != 0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Pending,
    Fired,
    Canceled,
}

#[derive(Debug)]
struct TimerShared {
    state: Mutex<TimerState>,
    notify: Notify,
}

impl TimerShared {
    /// Moves a pending timer to canceled. Returns `true` if it won the race.
    fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != TimerState::Pending {
            return false;
        }
        *state = TimerState::Canceled;
        drop(state);
        self.notify.notify_one();
        true
    }
}

/// A scheduled restart that either fires after its delay or is canceled.
#[derive(Debug)]
pub struct RestartTimer {
    delay: Duration,
    shared: Arc<TimerShared>,
    manager: Arc<Mutex<Inner>>,
}

impl RestartTimer {
    /// Backoff delay before the restart fires.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancels the timer. Returns `true` if it had not fired yet.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Waits for the delay to elapse or for cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`RestartCanceled`] if the timer was canceled first.
    pub async fn wait(self) -> std::result::Result<(), RestartCanceled> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => {}
            () = self.shared.notify.notified() => {}
        }
        let outcome = {
            let mut state = lock(&self.shared.state);
            if *state == TimerState::Pending {
                *state = TimerState::Fired;
            }
            *state
        };
        let mut manager = lock(&self.manager);
        manager.active = false;
        if manager
            .pending
            .as_ref()
            .is_some_and(|pending| Arc::ptr_eq(pending, &self.shared))
        {
            manager.pending = None;
        }
        match outcome {
            TimerState::Fired => Ok(()),
            TimerState::Pending | TimerState::Canceled => Err(RestartCanceled),
        }
    }
}
