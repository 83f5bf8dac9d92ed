// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-process mPlane deployment.
//!
//! [`LoopbackTransport`] hands a [`Client`](mplane_client::Client)'s messages
//! straight to [`Component`](mplane_component::Component)s in the same
//! process, and can simulate unreachable peers and lost registrations.
//! [`SleepService`] is a minimal measurement to run through it.

#![warn(missing_docs)]

mod sleep;
mod transport;

pub use crate::sleep::SleepService;
pub use crate::transport::LoopbackTransport;
