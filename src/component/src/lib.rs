// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Component side of mPlane.
//!
//! A [`Component`] binds [`Service`]s, advertises their capabilities to
//! authorized peers, and runs the specifications peers send it. Each peer
//! gets its own [`PeerContext`]; each accepted specification runs as an
//! independent task whose outcome is reconciled back into that context.

#![warn(missing_docs)]

pub mod authz;
pub mod dyncfgs;
pub mod peer;
pub mod scheduler;
pub mod service;

pub use crate::authz::{AllowAll, AllowList, Authorization};
pub use crate::dyncfgs::all_dyncfgs;
pub use crate::peer::{PeerContext, TokenPhase};
pub use crate::scheduler::{Component, SweepSummary};
pub use crate::service::{InterruptCheck, Service};
