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

//! Tokio task utilities.
//!
//! All tasks in the workspace are spawned through [`spawn`], which requires a
//! name. The name is attached to a `tracing` span wrapping the task, so that
//! log lines emitted from inside the task can be attributed to it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a new asynchronous task with a name.
///
/// The name is computed lazily so that callers can build it with `format!`
/// without paying for it when tracing is disabled.
#[track_caller]
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = nc();
    let span = tracing::debug_span!("task", name = name.as_ref());
    tokio::spawn(future.instrument(span))
}

/// Spawns a task that runs `f` once after `delay` has elapsed.
///
/// The returned handle aborts the timer when dropped, so a timer that is no
/// longer wanted can be cancelled by dropping it.
pub fn spawn_delayed<Name, NameClosure, F>(
    nc: NameClosure,
    delay: Duration,
    f: F,
) -> AbortOnDropHandle<()>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    F: FnOnce() + Send + 'static,
{
    spawn(nc, async move {
        tokio::time::sleep(delay).await;
        f();
    })
    .abort_on_drop()
}

/// Wraps a [`JoinHandle`] so that the task is aborted when the handle is
/// dropped, rather than detached.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> AbortOnDropHandle<T> {
    /// Reports whether the underlying task has finished.
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Extension methods for [`JoinHandle`].
pub trait JoinHandleExt<T> {
    /// Converts a [`JoinHandle`] into an [`AbortOnDropHandle`].
    fn abort_on_drop(self) -> AbortOnDropHandle<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDropHandle<T> {
        AbortOnDropHandle(self)
    }
}
