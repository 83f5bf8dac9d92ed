// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mplane_component::{InterruptCheck, Service};
use mplane_ore::now::NowFn;
use mplane_protocol::{
    Capability, Constraint, End, ResultMessage, Specification, Start, Value, When, VERB_MEASURE,
};
use tokio::time::Instant;

const DURATION: &str = "duration.s";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sleeps for `duration.s` seconds and reports how long it actually slept.
///
/// Checks for interrupts once a second, so an interrupted invocation returns
/// a shorter duration.
#[derive(Debug)]
pub struct SleepService {
    capability: Capability,
    now: NowFn,
}

impl SleepService {
    /// Creates the service, labeling its capability `label`.
    pub fn new(label: &str, now: NowFn) -> SleepService {
        let when = When::Span {
            start: Start::Now,
            end: End::Future,
        };
        SleepService {
            capability: Capability::new(VERB_MEASURE, when)
                .with_label(label)
                .with_parameter(DURATION, Constraint::Any)
                .with_result(DURATION),
            now,
        }
    }
}

#[async_trait]
impl Service for SleepService {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn run(
        &self,
        spec: Specification,
        interrupt: InterruptCheck,
    ) -> Result<ResultMessage, anyhow::Error> {
        let requested = spec
            .parameters
            .get(DURATION)
            .and_then(Value::as_f64)
            .context("duration.s must be a number")?;
        let requested = Duration::try_from_secs_f64(requested)
            .with_context(|| format!("invalid duration.s: {requested}"))?;

        let started_at = self.now.as_millis();
        let start = Instant::now();
        loop {
            let remaining = requested.saturating_sub(start.elapsed());
            if remaining.is_zero() || interrupt.is_interrupted() {
                break;
            }
            tokio::time::sleep(remaining.min(POLL_INTERVAL)).await;
        }
        let slept = start.elapsed();
        tracing::debug!(?requested, ?slept, "sleep finished");

        let when = When::realized(started_at, self.now.as_millis());
        Ok(ResultMessage::for_specification(&spec, when).with_value(DURATION, slept.as_secs_f64()))
    }
}
