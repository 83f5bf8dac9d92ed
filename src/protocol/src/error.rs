// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors for the crate

use crate::value::Value;

/// An error constructing or validating a protocol message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// A parameter the capability declares was neither supplied nor
    /// implied by a single-valued constraint.
    #[error("missing parameter: {0}")]
    MissingParameter(String),
    /// A parameter was supplied that the capability does not declare.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    /// A parameter value does not satisfy the capability's constraint.
    #[error("value {value} violates constraint {constraint} of parameter {name}")]
    ConstraintViolation {
        /// The parameter's name.
        name: String,
        /// The offending value.
        value: Value,
        /// The constraint, in its textual form.
        constraint: String,
    },
    /// A temporal scope ends before it starts.
    #[error("temporal scope ends before it starts: {0}")]
    EndBeforeStart(String),
}

/// An error parsing the textual or JSON form of a protocol element.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The JSON was malformed or did not describe a message.
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
    /// A temporal scope could not be parsed.
    #[error("invalid temporal scope {input:?}: {reason}")]
    When {
        /// The text that failed to parse.
        input: String,
        /// Why it failed.
        reason: String,
    },
    /// A timestamp could not be parsed.
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),
    /// A constraint could not be parsed.
    #[error("invalid constraint {input:?}: {reason}")]
    Constraint {
        /// The text that failed to parse.
        input: String,
        /// Why it failed.
        reason: String,
    },
    /// The parsed element was well formed but invalid.
    #[error(transparent)]
    Model(#[from] ModelError),
}
