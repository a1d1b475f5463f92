//! Lifecycle controls shared between the frame loop and its callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cooperative stop signal.
///
/// Clones share one flag. Blocking waits inside the crate go through
/// [`CancelToken::sleep`] so that they end as soon as the token fires.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _guard = lock(&self.inner.lock);
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` when the
    /// sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = lock(&self.inner.lock);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            guard = self
                .inner
                .wake
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    /// Stop requested; the loop is draining.
    Stopping,
    Stopped,
}

#[derive(Debug, Default)]
struct ControlShared {
    state: Mutex<RunState>,
    changed: Condvar,
    cancel: CancelToken,
}

/// Clonable remote control for a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct ControlHandle {
    shared: Arc<ControlShared>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        *lock(&self.shared.state)
    }

    /// Suspend frame processing. Tracker state is left untouched.
    pub fn pause(&self) -> bool {
        self.transition(|state| matches!(state, RunState::Running | RunState::Idle), RunState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(|state| state == RunState::Paused, RunState::Running)
    }

    /// Request an orderly stop: in-flight work is cancelled, buffered records
    /// are flushed, then the loop exits.
    pub fn stop(&self) {
        let mut state = lock(&self.shared.state);
        if *state != RunState::Stopped {
            *state = RunState::Stopping;
        }
        self.shared.cancel.cancel();
        self.shared.changed.notify_all();
        info!("stop requested");
    }

    /// Token that fires when [`ControlHandle::stop`] is called.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Block until the pipeline has fully stopped or `timeout` elapses.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let state = lock(&self.shared.state);
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| *s != RunState::Stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *state == RunState::Stopped
    }

    fn transition(&self, allowed: impl Fn(RunState) -> bool, next: RunState) -> bool {
        let mut state = lock(&self.shared.state);
        if !allowed(*state) {
            return false;
        }
        info!(from = ?*state, to = ?next, "pipeline state change");
        *state = next;
        self.shared.changed.notify_all();
        true
    }

    pub(crate) fn mark_running(&self) {
        let mut state = lock(&self.shared.state);
        if *state == RunState::Idle {
            *state = RunState::Running;
            self.shared.changed.notify_all();
        }
    }

    pub(crate) fn mark_stopped(&self) {
        *lock(&self.shared.state) = RunState::Stopped;
        self.shared.changed.notify_all();
    }

    /// Block while paused. Returns `false` once a stop has been requested.
    pub(crate) fn wait_while_paused(&self) -> bool {
        let state = lock(&self.shared.state);
        let state = self
            .shared
            .changed
            .wait_while(state, |s| *s == RunState::Paused)
            .unwrap_or_else(PoisonError::into_inner);
        !matches!(*state, RunState::Stopping | RunState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_cancel_interrupts_sleep() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let started = Instant::now();
        let sleeper = thread::spawn(move || token.sleep(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        trigger.cancel();
        assert!(!sleeper.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_pause_resume_stop() {
        let control = ControlHandle::new();
        control.mark_running();
        assert_eq!(control.state(), RunState::Running);

        assert!(control.pause());
        assert!(!control.pause());
        assert_eq!(control.state(), RunState::Paused);

        let waiter = control.clone();
        let blocked = thread::spawn(move || waiter.wait_while_paused());
        thread::sleep(Duration::from_millis(20));
        assert!(control.resume());
        assert!(blocked.join().unwrap());

        control.stop();
        assert_eq!(control.state(), RunState::Stopping);
        assert!(control.cancel_token().is_cancelled());
        assert!(!control.wait_while_paused());

        control.mark_stopped();
        assert!(control.wait_stopped(Duration::from_millis(10)));
        assert!(!control.resume());
    }

    #[test]
    fn test_stop_releases_paused_loop() {
        let control = ControlHandle::new();
        control.mark_running();
        control.pause();
        let waiter = control.clone();
        let blocked = thread::spawn(move || waiter.wait_while_paused());
        thread::sleep(Duration::from_millis(20));
        control.stop();
        assert!(!blocked.join().unwrap());
    }
}
