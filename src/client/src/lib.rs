// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Client side of mPlane.
//!
//! A [`Registry`] records the capabilities peers offer and the receipts,
//! results and exceptions that come back for specifications sent to them.
//! A [`Client`] drives it over a [`Transport`]: registering, invoking,
//! redeeming and interrupting, retrying unreachable peers along the way.
//!
//! A client can also be the passive side, when components connect to it and
//! poll for work. Then the embedding server feeds incoming messages to
//! [`Registry::handle_message`], queues work with
//! [`Registry::push_outgoing`] and answers polls with
//! [`Registry::pull_outgoing`].

#![warn(missing_docs)]

mod client;
pub mod dyncfgs;
pub mod error;
pub mod registry;
pub mod transport;

pub use crate::client::Client;
pub use crate::dyncfgs::all_dyncfgs;
pub use crate::error::{ClientError, TransportError};
pub use crate::registry::Registry;
pub use crate::transport::Transport;
