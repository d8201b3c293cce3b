use std::{future::Future, sync::Mutex, time::Duration};

use tokio::task::JoinHandle;

use crate::lock;

/// A slot holding at most one scheduled task.
///
/// Scheduling into an occupied slot aborts the previous task first, so a
/// superseded timer can never fire against newer state.
#[derive(Default)]
pub struct TimerSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` after `delay` unless cancelled or replaced first.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        if let Some(previous) = lock(&self.handle).replace(handle) {
            previous.abort();
        }
    }

    /// Returns true if a pending task was cancelled.
    pub fn cancel(&self) -> bool {
        match lock(&self.handle).take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.handle).take() {
            handle.abort();
        }
    }
}
