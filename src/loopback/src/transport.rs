// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mplane_client::{Transport, TransportError};
use mplane_component::Component;
use mplane_protocol::{Envelope, Message, PeerId};
use tracing::debug;

#[derive(Debug, Default)]
struct Faults {
    /// Remaining attempts that fail as unreachable, per component.
    unreachable: BTreeMap<PeerId, usize>,
    /// Components that currently know the client.
    registered: BTreeSet<PeerId>,
}

/// A [`Transport`] that delivers messages to in-process components.
#[derive(Debug)]
pub struct LoopbackTransport {
    /// How the client is identified to every component.
    client: PeerId,
    components: BTreeMap<PeerId, Arc<Component>>,
    faults: Mutex<Faults>,
}

impl LoopbackTransport {
    /// Creates a transport that identifies its client as `client`.
    pub fn new(client: PeerId) -> LoopbackTransport {
        LoopbackTransport {
            client,
            components: BTreeMap::new(),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Makes `component` reachable as `identity`.
    pub fn with_component(mut self, identity: PeerId, component: Arc<Component>) -> Self {
        self.components.insert(identity, component);
        self
    }

    /// The identity the client has at the components.
    pub fn client(&self) -> &PeerId {
        &self.client
    }

    /// Fails the next `attempts` requests to `identity` as unreachable.
    pub fn fail_next(&self, identity: &PeerId, attempts: usize) {
        self.faults
            .lock()
            .expect("lock poisoned")
            .unreachable
            .insert(identity.clone(), attempts);
    }

    /// Makes `identity` forget the client's registration, as after a
    /// component restart.
    pub fn forget_registration(&self, identity: &PeerId) {
        self.faults
            .lock()
            .expect("lock poisoned")
            .registered
            .remove(identity);
    }

    fn component(&self, identity: &PeerId) -> Result<&Arc<Component>, TransportError> {
        let mut faults = self.faults.lock().expect("lock poisoned");
        if let Some(remaining) = faults.unreachable.get_mut(identity) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Unreachable(format!(
                    "{identity}: injected failure"
                )));
            }
        }
        self.components
            .get(identity)
            .ok_or_else(|| TransportError::Unreachable(format!("{identity}: no such component")))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn register(&self, identity: &PeerId) -> Result<Envelope, TransportError> {
        let component = self.component(identity)?;
        debug!(%identity, client = %self.client, "registering");
        self.faults
            .lock()
            .expect("lock poisoned")
            .registered
            .insert(identity.clone());
        Ok(component.capabilities_for(&self.client))
    }

    async fn send(&self, identity: &PeerId, message: Message) -> Result<Message, TransportError> {
        let component = self.component(identity)?;
        let registered = self
            .faults
            .lock()
            .expect("lock poisoned")
            .registered
            .contains(identity);
        if !registered {
            return Err(TransportError::NotRegistered);
        }
        let reply = component.handle_and_wait(&self.client, message).await;
        Ok(reply.into())
    }
}
