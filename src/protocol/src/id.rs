// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Identifiers: message tokens and peer identities.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The deterministic identity of a capability or an invocation.
///
/// Tokens are hex SHA-256 digests of a canonical JSON rendering of the
/// identifying fields of a message, so equal messages always have equal
/// tokens. Tokens received from peers are treated as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Digests a canonical rendering into a token.
    ///
    /// `serde_json` objects are sorted by key, so the rendering does not
    /// depend on the order in which fields were inserted.
    pub(crate) fn digest(canonical: &serde_json::Value) -> Token {
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        Token(format!("{:x}", hasher.finalize()))
    }

    /// The token's textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Token {
        Token(s.to_owned())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Token {
        Token(s)
    }
}

/// The identity of a remote peer, as established by the transport.
///
/// Stable for the life of a connection or session; otherwise opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// The identity's textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> PeerId {
        PeerId(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> PeerId {
        PeerId(s)
    }
}
