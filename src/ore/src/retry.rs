// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry utilities.
//!
//! A [`Retry`] describes a backoff policy. Operations are retried by passing a
//! closure to [`Retry::retry_async`], which is invoked once per attempt with a
//! [`RetryState`] describing the attempt.
//!
//! ```
//! # use std::time::Duration;
//! # use mplane_ore::retry::Retry;
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let res: Result<usize, &str> = Retry::fixed(Duration::from_millis(1))
//!     .max_tries(3)
//!     .retry_async(|state| async move {
//!         if state.i < 2 { Err("not yet") } else { Ok(state.i) }
//!     })
//!     .await;
//! assert_eq!(res, Ok(2));
//! # });
//! ```

use std::future::Future;
use std::time::Duration;

/// The state of a retry operation, passed to the closure on each attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryState {
    /// The retry counter, starting from zero on the first try.
    pub i: usize,
    /// The duration that will be slept before the next attempt, or `None` if
    /// this is the last attempt.
    pub next_backoff: Option<Duration>,
}

/// The outcome of a single attempt of a classified retry.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The attempt succeeded.
    Ok(T),
    /// The attempt failed in a way that may succeed if retried.
    RetryableErr(E),
    /// The attempt failed in a way that will not succeed if retried.
    FatalErr(E),
}

impl<T, E> From<Result<T, E>> for RetryResult<T, E> {
    fn from(res: Result<T, E>) -> RetryResult<T, E> {
        match res {
            Ok(t) => RetryResult::Ok(t),
            Err(e) => RetryResult::RetryableErr(e),
        }
    }
}

/// Configures a retry operation.
#[derive(Clone, Copy, Debug)]
pub struct Retry {
    initial_backoff: Duration,
    factor: f64,
    clamp_backoff: Duration,
    max_tries: usize,
}

impl Default for Retry {
    /// Constructs a retry operation that will retry forever with exponential
    /// backoff starting at 125ms and doubling up to 1s.
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::from_secs(1),
            max_tries: usize::MAX,
        }
    }
}

impl Retry {
    /// Constructs a retry operation that sleeps exactly `backoff` between
    /// attempts, forever unless limited with [`Retry::max_tries`].
    pub fn fixed(backoff: Duration) -> Self {
        Retry {
            initial_backoff: backoff,
            factor: 1.0,
            clamp_backoff: backoff,
            ..Default::default()
        }
    }

    /// Sets the initial backoff for the retry operation.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the maximum backoff between attempts.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the maximum number of attempts, including the first.
    ///
    /// A value of zero is treated as one.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    /// Retries the asynchronous operation `f` until it returns `Ok` or the
    /// policy is exhausted, in which case the last error is returned.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        self.retry_async_classified(|state| {
            let fut = f(state);
            async move { RetryResult::from(fut.await) }
        })
        .await
    }

    /// Like [`Retry::retry_async`], but the closure classifies its errors as
    /// retryable or fatal. Fatal errors are returned immediately.
    pub async fn retry_async_classified<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = RetryResult<T, E>>,
    {
        let mut backoff = self.initial_backoff.min(self.clamp_backoff);
        let mut i = 0;
        loop {
            let last_try = i + 1 >= self.max_tries;
            let state = RetryState {
                i,
                next_backoff: if last_try { None } else { Some(backoff) },
            };
            match f(state).await {
                RetryResult::Ok(t) => return Ok(t),
                RetryResult::FatalErr(e) => return Err(e),
                RetryResult::RetryableErr(e) if last_try => return Err(e),
                RetryResult::RetryableErr(_) => {
                    tokio::time::sleep(backoff).await;
                    i += 1;
                    backoff = Duration::try_from_secs_f64(backoff.as_secs_f64() * self.factor)
                        .unwrap_or(self.clamp_backoff)
                        .min(self.clamp_backoff);
                }
            }
        }
    }
}
