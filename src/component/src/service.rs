// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The contract between the scheduler and the services it runs.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mplane_protocol::{Capability, ResultMessage, Specification};

/// A bound measurement or query.
///
/// Each invocation runs as its own task, concurrently with other invocations
/// of the same service. A service must yield regularly and poll its
/// [`InterruptCheck`] while it does; once the check reports an interrupt the
/// service should promptly return whatever partial result it has. The
/// scheduler never cancels a running invocation by force.
#[async_trait]
pub trait Service: Debug + Send + Sync + 'static {
    /// The capability this service implements.
    fn capability(&self) -> &Capability;

    /// Runs `spec`, which fulfills [`Service::capability`].
    ///
    /// Returning an error, or panicking, completes the invocation with an
    /// exception for its token.
    async fn run(
        &self,
        spec: Specification,
        interrupt: InterruptCheck,
    ) -> Result<ResultMessage, anyhow::Error>;
}

/// The cooperative cancellation signal for one invocation.
#[derive(Debug, Clone, Default)]
pub struct InterruptCheck(Arc<AtomicBool>);

impl InterruptCheck {
    /// Reports whether the invocation has been interrupted, either explicitly
    /// or because its temporal scope ended.
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Flags the invocation as interrupted. Never cleared.
    pub(crate) fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
