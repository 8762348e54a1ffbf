use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A one-shot timer whose action can be cancelled or replaced before it
/// fires.
///
/// Arming spawns a task that sleeps and then runs the action; cancelling
/// aborts that task. The action runs at most once per arming, and never after
/// [OneShotTimer::cancel] returned or the timer was dropped.
pub struct OneShotTimer {
    handle: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    pub fn new() -> OneShotTimer {
        OneShotTimer { handle: None }
    }

    /// Schedules `action` to run after `delay`, cancelling any previously
    /// armed action that has not fired yet.
    pub fn arm<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// True while an action is scheduled and has neither fired nor been
    /// cancelled.
    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
