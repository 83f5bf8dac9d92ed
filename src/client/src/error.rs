// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors for the crate

use mplane_protocol::{ModelError, PeerId, ProtocolException};

/// A failure of the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer could not be reached. Worth retrying.
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    /// The peer does not know this client and wants it to register again.
    #[error("not registered")]
    NotRegistered,
    /// The peer refused the request. Not worth retrying.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// An error from the client registry or retrieval loop.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Nothing is known under this token or label.
    #[error("no such token or label: {0}")]
    NoSuchTokenOrLabel(String),
    /// The identity has no registered capabilities.
    #[error("not registered: {0}")]
    NotRegistered(PeerId),
    /// A specification could not be derived.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// The transport failed, after retries where those apply.
    #[error("transport to {identity} failed: {source}")]
    Transport {
        /// The peer the transport was talking to.
        identity: PeerId,
        /// The final transport error.
        #[source]
        source: TransportError,
    },
    /// The peer answered with an exception.
    #[error("rejected by peer: {0}")]
    Rejected(ProtocolException),
    /// A client received a message only a component handles.
    #[error("unsupported message for this role: {0}")]
    UnsupportedMessage(&'static str),
}
