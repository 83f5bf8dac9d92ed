// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Authorization collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use mplane_protocol::{Capability, PeerId};

/// Decides which peers may see and invoke which capabilities.
///
/// Consulted before any invocation and before a capability is advertised to
/// a peer.
pub trait Authorization: Debug + Send + Sync {
    /// Reports whether `peer` may use `capability`.
    fn authorized(&self, capability: &Capability, peer: &PeerId) -> bool;
}

/// Authorizes everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorization for AllowAll {
    fn authorized(&self, _: &Capability, _: &PeerId) -> bool {
        true
    }
}

/// Authorizes peers by capability label.
///
/// A capability whose label has no entry, or that has no label, is denied to
/// everyone.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: BTreeMap<String, BTreeSet<PeerId>>,
}

impl AllowList {
    /// Permits `peer` to use capabilities labeled `label`.
    pub fn allow(mut self, label: impl Into<String>, peer: impl Into<PeerId>) -> Self {
        self.allowed
            .entry(label.into())
            .or_default()
            .insert(peer.into());
        self
    }
}

impl Authorization for AllowList {
    fn authorized(&self, capability: &Capability, peer: &PeerId) -> bool {
        capability
            .label
            .as_ref()
            .and_then(|label| self.allowed.get(label))
            .map_or(false, |peers| peers.contains(peer))
    }
}
