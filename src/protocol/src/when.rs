// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Temporal scopes.
//!
//! A [`When`] says when a capability is available, when a specification
//! should run, or when a result was actually measured. Its textual form is
//! one of:
//!
//! * `now`: a single-shot invocation starting immediately.
//! * `now ... future`: starts immediately, runs until interrupted.
//! * `<ts> ... future`: starts at `<ts>`, runs until interrupted.
//! * `now ... <ts>`: starts immediately, runs until `<ts>`.
//! * `<ts> ... <ts>`: an absolute interval.
//!
//! Timestamps are UTC, written `2024-05-01 12:00:00.000`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use mplane_ore::now::{to_datetime, to_epoch_millis, EpochMillis};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ParseError};
use crate::value::RANGE_SEPARATOR;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const TIMESTAMP_PARSE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// The beginning of a temporal scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Start {
    /// Whenever the scope is evaluated.
    Now,
    /// An absolute instant.
    At(EpochMillis),
}

/// The end of a temporal scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum End {
    /// Unbounded; only an explicit interrupt terminates the scope.
    Future,
    /// An absolute instant.
    At(EpochMillis),
}

/// A temporal scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum When {
    /// Start now, run once.
    Immediate,
    /// A possibly open-ended interval.
    Span {
        /// When the scope begins.
        start: Start,
        /// When the scope ends.
        end: End,
    },
}

/// The timers needed to honor a [`When`], relative to the instant it was
/// evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// How long to wait before starting.
    pub start_delay: Duration,
    /// How long until the scope ends, if it is bounded.
    pub end_delay: Option<Duration>,
}

impl When {
    /// Constructs a span, rejecting spans whose absolute end precedes their
    /// absolute start.
    pub fn span(start: Start, end: End) -> Result<When, ModelError> {
        let when = When::Span { start, end };
        match (start, end) {
            (Start::At(s), End::At(e)) if e < s => {
                Err(ModelError::EndBeforeStart(when.to_string()))
            }
            _ => Ok(when),
        }
    }

    /// The absolute interval `[start, end]`, as realized by a measurement.
    ///
    /// An `end` earlier than `start` is clamped to `start`.
    pub fn realized(start: EpochMillis, end: EpochMillis) -> When {
        When::Span {
            start: Start::At(start),
            end: End::At(end.max(start)),
        }
    }

    /// The absolute start of this scope, evaluated at `now`.
    pub fn start_at(&self, now: EpochMillis) -> EpochMillis {
        match self {
            When::Immediate
            | When::Span {
                start: Start::Now, ..
            } => now,
            When::Span {
                start: Start::At(t),
                ..
            } => *t,
        }
    }

    /// The absolute end of this scope, if it is bounded.
    pub fn end_bound(&self) -> Option<EpochMillis> {
        match self {
            When::Span { end: End::At(t), .. } => Some(*t),
            When::Immediate | When::Span { end: End::Future, .. } => None,
        }
    }

    /// Reports whether this scope's bounded end already lies in the past.
    pub fn is_expired(&self, now: EpochMillis) -> bool {
        self.end_bound().map_or(false, |end| end < now)
    }

    /// Reports whether this scope is over at `now`.
    ///
    /// An immediate scope is over as soon as it is realized, an unbounded one
    /// never is.
    pub fn end_elapsed(&self, now: EpochMillis) -> bool {
        match self {
            When::Immediate => true,
            When::Span { end: End::Future, .. } => false,
            When::Span { end: End::At(t), .. } => *t <= now,
        }
    }

    /// Computes the start and end timers for this scope evaluated at `now`,
    /// or `None` if the scope has expired.
    pub fn schedule(&self, now: EpochMillis) -> Option<Schedule> {
        if self.is_expired(now) {
            return None;
        }
        let start_delay = Duration::from_millis(self.start_at(now).saturating_sub(now));
        let end_delay = self
            .end_bound()
            .map(|end| Duration::from_millis(end.saturating_sub(now)));
        Some(Schedule {
            start_delay,
            end_delay,
        })
    }
}

/// Formats epoch milliseconds the way temporal scopes spell timestamps.
pub fn format_timestamp(millis: EpochMillis) -> String {
    to_datetime(millis).format(TIMESTAMP_FORMAT).to_string()
}

/// Parses a timestamp as written in temporal scopes, or as RFC 3339.
pub fn parse_timestamp(s: &str) -> Result<EpochMillis, ParseError> {
    let s = s.trim();
    for format in TIMESTAMP_PARSE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(to_epoch_millis(&naive.and_utc()));
        }
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| to_epoch_millis(&dt.with_timezone(&Utc)))
        .map_err(|_| ParseError::Timestamp(s.to_owned()))
}

impl fmt::Display for Start {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Start::Now => f.write_str("now"),
            Start::At(t) => f.write_str(&format_timestamp(*t)),
        }
    }
}

impl fmt::Display for End {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            End::Future => f.write_str("future"),
            End::At(t) => f.write_str(&format_timestamp(*t)),
        }
    }
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            When::Immediate => f.write_str("now"),
            When::Span { start, end } => write!(f, "{start}{RANGE_SEPARATOR}{end}"),
        }
    }
}

impl FromStr for When {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<When, ParseError> {
        let s = s.trim();
        if s == "now" {
            return Ok(When::Immediate);
        }
        let Some((start, end)) = s.split_once(RANGE_SEPARATOR.trim()) else {
            return Err(ParseError::When {
                input: s.to_owned(),
                reason: "expected `now` or `<start> ... <end>`".into(),
            });
        };
        let start = match start.trim() {
            "now" => Start::Now,
            ts => Start::At(parse_timestamp(ts)?),
        };
        let end = match end.trim() {
            "future" => End::Future,
            ts => End::At(parse_timestamp(ts)?),
        };
        Ok(When::span(start, end)?)
    }
}

impl From<When> for String {
    fn from(when: When) -> String {
        when.to_string()
    }
}

impl TryFrom<String> for When {
    type Error = ParseError;

    fn try_from(s: String) -> Result<When, ParseError> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: EpochMillis = 1_700_000_000_000;

    #[test]
    fn text_forms() {
        assert_eq!("now".parse::<When>().unwrap(), When::Immediate);
        assert_eq!(
            "now ... future".parse::<When>().unwrap(),
            When::Span {
                start: Start::Now,
                end: End::Future
            }
        );
        let when: When = "2023-11-14 22:13:20.000 ... 2023-11-14 22:13:30"
            .parse()
            .unwrap();
        assert_eq!(when, When::realized(T0, T0 + 10_000));
        assert_eq!(
            when.to_string(),
            "2023-11-14 22:13:20.000 ... 2023-11-14 22:13:30.000"
        );
        assert_eq!(
            "2023-11-14T22:13:20Z ... future".parse::<When>().unwrap(),
            When::Span {
                start: Start::At(T0),
                end: End::Future
            }
        );

        assert!("later".parse::<When>().is_err());
        assert!("now ... whenever".parse::<When>().is_err());
        assert!(matches!(
            "2023-11-14 22:13:30 ... 2023-11-14 22:13:20".parse::<When>(),
            Err(ParseError::Model(ModelError::EndBeforeStart(_)))
        ));
    }

    #[test]
    fn expiry_and_schedule() {
        let bounded = When::span(Start::At(T0 + 2_000), End::At(T0 + 10_000)).unwrap();
        assert!(!bounded.is_expired(T0));
        assert_eq!(
            bounded.schedule(T0),
            Some(Schedule {
                start_delay: Duration::from_secs(2),
                end_delay: Some(Duration::from_secs(10)),
            })
        );
        // The end instant itself is still schedulable.
        assert!(!bounded.is_expired(T0 + 10_000));
        assert!(bounded.is_expired(T0 + 10_001));
        assert_eq!(bounded.schedule(T0 + 10_001), None);

        let late_start = When::span(Start::At(T0), End::Future).unwrap();
        assert_eq!(
            late_start.schedule(T0 + 5_000),
            Some(Schedule {
                start_delay: Duration::ZERO,
                end_delay: None,
            })
        );

        assert!(!When::Immediate.is_expired(T0));
        assert_eq!(When::Immediate.schedule(T0).unwrap().start_delay, Duration::ZERO);
    }

    #[test]
    fn end_elapsed() {
        assert!(When::Immediate.end_elapsed(T0));
        assert!(!When::realized(T0, T0 + 1_000).end_elapsed(T0 + 999));
        assert!(When::realized(T0, T0 + 1_000).end_elapsed(T0 + 1_000));
        let open = When::span(Start::Now, End::Future).unwrap();
        assert!(!open.end_elapsed(u64::MAX));
    }

    #[test]
    fn realized_clamps_end() {
        assert_eq!(When::realized(T0, T0 - 5), When::realized(T0, T0));
    }
}
