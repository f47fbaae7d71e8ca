/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! One-slot event flag shared between the scheduler loop and its producers.
//!
//! A signal raised while nobody is waiting is remembered until the next wait
//! consumes it, so wake-ups are never lost between two loop iterations.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct WaitObj {
    signaled: Mutex<bool>,
    notify: Notify,
}

impl WaitObj {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise the flag and wake every waiter.
    pub fn signal(&self) {
        *self.flag() = true;
        self.notify.notify_waiters();
    }

    /// Clear the flag without waiting.
    pub fn reset(&self) {
        *self.flag() = false;
    }

    /// Wait until signalled or until `timeout` elapses (forever when `None`).
    ///
    /// Returns whether the flag was raised.  The flag is left as is.
    pub async fn wait_for_event(&self, timeout: Option<Duration>) -> bool {
        self.wait(timeout.map(|t| Instant::now() + t), false).await
    }

    /// Wait like [`wait_for_event`](Self::wait_for_event), then clear the flag.
    pub async fn wait_and_reset(&self, timeout: Duration) -> bool {
        self.wait(Some(Instant::now() + timeout), true).await
    }

    async fn wait(&self, deadline: Option<Instant>, reset: bool) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent signal
            // cannot slip between the check and the await.
            notified.as_mut().enable();

            {
                let mut flag = self.flag();
                if *flag {
                    if reset {
                        *flag = false;
                    }
                    return true;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let mut flag = self.flag();
                        let raised = *flag;
                        if reset {
                            *flag = false;
                        }
                        return raised;
                    }
                }
                None => notified.await,
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
