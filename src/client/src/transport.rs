// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The boundary to the transport collaborator.

use async_trait::async_trait;
use mplane_protocol::{Envelope, Message, PeerId};

use crate::error::TransportError;

/// Carries messages between a client and the components it talks to.
///
/// Implementations perform a single attempt per call; retrying is the
/// client's job.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers with the component at `identity` and fetches the
    /// capabilities it advertises to this client.
    async fn register(&self, identity: &PeerId) -> Result<Envelope, TransportError>;

    /// Sends `message` to the component at `identity` and returns its reply.
    async fn send(&self, identity: &PeerId, message: Message) -> Result<Message, TransportError>;
}
