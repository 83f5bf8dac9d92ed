// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The mPlane message model.
//!
//! A Component advertises [`Capability`]s. A Client binds one to concrete
//! parameter values and a temporal scope, producing a [`Specification`],
//! and sends it. The Component answers with a [`Receipt`], and later, in
//! response to a [`Redemption`], with a [`ResultMessage`] or a
//! [`ProtocolException`]. Capabilities are retracted with a [`Withdrawal`];
//! pending or running specifications are stopped with an [`Interrupt`].
//!
//! Every capability and specification has a deterministic [`Token`]: equal
//! messages have equal tokens, which is what makes resubmission idempotent.
//!
//! Everything in this crate is pure data and pure functions.

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod message;
pub mod value;
pub mod when;

pub use crate::error::{ModelError, ParseError};
pub use crate::id::{PeerId, Token};
pub use crate::message::{
    capabilities_matching_schema, Capability, Envelope, Interrupt, Message, ProtocolException,
    Receipt, Redemption, Reply, ResultMessage, Specification, Withdrawal, VERB_MEASURE,
    VERB_QUERY,
};
pub use crate::value::{Constraint, Value};
pub use crate::when::{End, Schedule, Start, When};
