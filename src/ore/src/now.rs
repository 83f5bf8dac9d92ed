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

//! Now utilities.
//!
//! Code that needs the wall-clock time takes a [`NowFn`] rather than calling
//! [`std::time::SystemTime::now`] directly, so that tests can substitute a
//! clock they control.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

/// A type representing the number of milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// Converts epoch milliseconds to a `DateTime`.
///
/// Saturates at the latest representable instant.
pub fn to_datetime(millis: EpochMillis) -> DateTime<Utc> {
    let millis = i64::try_from(millis).unwrap_or(i64::MAX);
    match Utc.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(dt) => dt,
        _ => DateTime::<Utc>::MAX_UTC,
    }
}

/// Converts a `DateTime` to epoch milliseconds, clamping instants before the
/// epoch to zero.
pub fn to_epoch_millis(dt: &DateTime<Utc>) -> EpochMillis {
    u64::try_from(dt.timestamp_millis()).unwrap_or(0)
}

/// A function that returns system or mocked time.
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> EpochMillis + Send + Sync>);

impl NowFn {
    /// Returns now in epoch milliseconds.
    pub fn as_millis(&self) -> EpochMillis {
        (self.0)()
    }

    /// Returns now as a UTC `DateTime`.
    pub fn as_datetime(&self) -> DateTime<Utc> {
        to_datetime(self.as_millis())
    }
}

impl fmt::Debug for NowFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<now_fn>")
    }
}

impl Deref for NowFn {
    type Target = dyn Fn() -> EpochMillis + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &(*self.0)
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> EpochMillis + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn {
        NowFn(Arc::new(f))
    }
}

fn system_time() -> EpochMillis {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// A [`NowFn`] that returns the actual system time.
pub static SYSTEM_TIME: LazyLock<NowFn> = LazyLock::new(|| NowFn::from(system_time));

/// A [`NowFn`] that always returns zero.
pub static NOW_ZERO: LazyLock<NowFn> = LazyLock::new(|| NowFn::from(|| 0));

/// A manually advanced clock, for tests.
///
/// Clones share the same underlying instant.
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: EpochMillis) -> Self {
        ManualClock(Arc::new(AtomicU64::new(start)))
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.0.fetch_add(by, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute reading.
    pub fn set(&self, millis: EpochMillis) {
        self.0.store(millis, Ordering::SeqCst);
    }

    /// Returns a [`NowFn`] reading this clock.
    pub fn now_fn(&self) -> NowFn {
        let inner = Arc::clone(&self.0);
        NowFn::from(move || inner.load(Ordering::SeqCst))
    }
}

/// Returns a [`NowFn`] that reads `base` plus the time elapsed on tokio's
/// clock since this call.
///
/// Under a paused tokio runtime this clock only moves when tokio's virtual
/// time does, which keeps wall-clock decisions in step with tokio timers.
///
/// Must be called from within a tokio runtime.
pub fn tokio_clock(base: EpochMillis) -> NowFn {
    let start = tokio::time::Instant::now();
    NowFn::from(move || {
        let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        base.saturating_add(elapsed)
    })
}
