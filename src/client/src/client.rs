// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client-initiated retrieval loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use mplane_dyncfg::ConfigSet;
use mplane_ore::now::NowFn;
use mplane_ore::retry::{Retry, RetryResult};
use mplane_ore::task::{self, AbortOnDropHandle, JoinHandleExt};
use mplane_protocol::{Interrupt, Message, PeerId, Redemption, Reply, Token, Value, When};
use tracing::{debug, info, warn};

use crate::dyncfgs;
use crate::error::{ClientError, TransportError};
use crate::registry::Registry;
use crate::transport::Transport;

/// A client that reaches components through a [`Transport`].
///
/// Unreachable peers are retried with a fixed backoff. A peer that has
/// forgotten this client is registered with again and the request resent.
#[derive(Debug)]
pub struct Client<T> {
    transport: T,
    config: ConfigSet,
    registry: Mutex<Registry>,
}

impl<T: Transport> Client<T> {
    /// Creates a client with an empty registry.
    pub fn new(transport: T, now: NowFn, config: ConfigSet) -> Client<T> {
        Client {
            transport,
            config,
            registry: Mutex::new(Registry::new(now)),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Locks the registry.
    ///
    /// The guard must not be held across an await point.
    pub fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("lock poisoned")
    }

    fn retry(&self) -> Retry {
        Retry::fixed(dyncfgs::RETRY_BACKOFF.get(&self.config))
            .max_tries(dyncfgs::RETRY_MAX_TRIES.get(&self.config))
    }

    /// Registers with the component at `identity` and records the
    /// capabilities it offers. Returns how many it offered.
    pub async fn register(&self, identity: &PeerId) -> Result<usize, ClientError> {
        self.retry()
            .retry_async_classified(|state| async move {
                classify(identity, state.i, self.register_once(identity).await)
            })
            .await
    }

    async fn register_once(&self, identity: &PeerId) -> Result<usize, ClientError> {
        let offered = self
            .transport
            .register(identity)
            .await
            .map_err(|source| ClientError::Transport {
                identity: identity.clone(),
                source,
            })?;
        let mut capabilities = Vec::new();
        for message in offered.flatten() {
            match message {
                Message::Capability(capability) => capabilities.push(capability),
                message => warn!(%identity, kind = message.kind(), "ignoring non-capability offer"),
            }
        }
        let count = self.registry().replace_offer(identity, capabilities);
        info!(%identity, capabilities = count, "registered");
        Ok(count)
    }

    /// Sends `message` to `identity` and returns the reply, registering
    /// again and resending once if the peer has forgotten us.
    async fn send(&self, identity: &PeerId, message: Message) -> Result<Message, ClientError> {
        self.retry()
            .retry_async_classified(|state| {
                let message = message.clone();
                async move {
                    let result = match self.transport.send(identity, message.clone()).await {
                        Err(TransportError::NotRegistered) => {
                            info!(%identity, "peer does not know us, registering again");
                            match self.register_once(identity).await {
                                Ok(_) => self.transport.send(identity, message).await,
                                Err(e) => return classify(identity, state.i, Err(e)),
                            }
                        }
                        result => result,
                    };
                    let result = result.map_err(|source| ClientError::Transport {
                        identity: identity.clone(),
                        source,
                    });
                    classify(identity, state.i, result)
                }
            })
            .await
            .map(|reply| {
                self.registry().refresh(identity);
                reply
            })
    }

    /// Sends `message` to `identity` and feeds the reply into the registry.
    async fn exchange(&self, identity: &PeerId, message: Message) -> Result<(), ClientError> {
        let reply = self.send(identity, message).await?;
        self.registry().handle_message(reply, identity)
    }

    /// Invokes the capability named by `token_or_label` and returns what is
    /// known about the invocation afterwards: usually a receipt, or the
    /// outcome if the component replied with it directly.
    pub async fn invoke_capability(
        &self,
        token_or_label: &str,
        when: When,
        parameters: BTreeMap<String, Value>,
        relabel: Option<String>,
    ) -> Result<Reply, ClientError> {
        let (identity, spec) =
            self.registry()
                .spec_for(token_or_label, when, parameters, relabel)?;
        let token = spec.token();
        info!(%identity, %token, label = ?spec.label, "invoking capability");
        self.exchange(&identity, spec.into()).await?;
        self.registry().lookup(token.as_str())
    }

    /// Interrupts the pending or running specification named by
    /// `token_or_label`.
    pub async fn interrupt_capability(&self, token_or_label: &str) -> Result<(), ClientError> {
        let (identity, interrupt) = {
            let registry = self.registry();
            let interrupt = match registry.lookup(token_or_label)? {
                Reply::Receipt(receipt) => Interrupt {
                    token: receipt.token,
                    label: receipt.label,
                },
                Reply::Result(result) => Interrupt {
                    token: result.token,
                    label: result.label,
                },
                reply => match reply.token() {
                    Some(token) => Interrupt {
                        token: token.clone(),
                        label: None,
                    },
                    None => return Err(ClientError::NoSuchTokenOrLabel(token_or_label.to_owned())),
                },
            };
            let identity = registry.identity_for(interrupt.token.as_str())?.clone();
            (identity, interrupt)
        };
        info!(%identity, token = %interrupt.token, "interrupting");
        // An exception here means the specification is not running, which
        // is not an outcome for it.
        match self.send(&identity, interrupt.into()).await? {
            Message::Exception(exception) => Err(ClientError::Rejected(exception)),
            _ => Ok(()),
        }
    }

    /// Returns the final outcome of the specification named by
    /// `token_or_label` if it is known, redeeming its receipt first if
    /// needed. Returns the receipt if the outcome is still not available.
    pub async fn result_for(&self, token_or_label: &str) -> Result<Reply, ClientError> {
        let (identity, redemption) = {
            let registry = self.registry();
            let receipt = match registry.lookup(token_or_label)? {
                Reply::Receipt(receipt) => receipt,
                outcome => return Ok(outcome),
            };
            let identity = registry.identity_for(receipt.token.as_str())?.clone();
            (identity, Redemption::for_receipt(&receipt))
        };
        debug!(%identity, token = %redemption.token, "redeeming");
        let token = redemption.token.clone();
        self.exchange(&identity, redemption.into()).await?;
        self.registry().lookup(token.as_str())
    }

    /// Withdraws every capability whose offering peer has gone quiet.
    pub fn expire_capabilities(&self) -> Vec<Token> {
        let ttl = dyncfgs::CAPABILITY_TTL.get(&self.config);
        self.registry().expire_capabilities(ttl)
    }

    /// Purges results and exceptions that have outlived
    /// `mplane_client_result_ttl`. Returns how many were purged.
    pub fn sweep(&self) -> usize {
        let ttl = dyncfgs::RESULT_TTL.get(&self.config);
        let purged = self.registry().sweep(ttl);
        if purged > 0 {
            debug!(purged, "sweep complete");
        }
        purged
    }
}

impl<T: Transport + 'static> Client<T> {
    /// Spawns a task that expires capabilities and calls [`Client::sweep`]
    /// every `mplane_client_sweep_interval`, until the Client or the handle
    /// is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> AbortOnDropHandle<()> {
        let client = Arc::downgrade(self);
        task::spawn(|| "client-sweeper", async move {
            loop {
                let interval = match client.upgrade() {
                    Some(client) => dyncfgs::SWEEP_INTERVAL.get(&client.config),
                    None => return,
                };
                tokio::time::sleep(interval).await;
                match client.upgrade() {
                    Some(client) => {
                        client.expire_capabilities();
                        client.sweep();
                    }
                    None => return,
                }
            }
        })
        .abort_on_drop()
    }
}

/// Only unreachable peers are worth another attempt.
fn classify<T>(
    identity: &PeerId,
    attempt: usize,
    result: Result<T, ClientError>,
) -> RetryResult<T, ClientError> {
    match result {
        Ok(t) => RetryResult::Ok(t),
        Err(
            e @ ClientError::Transport {
                source: TransportError::Unreachable(_),
                ..
            },
        ) => {
            warn!(%identity, attempt, "request failed: {e}");
            RetryResult::RetryableErr(e)
        }
        Err(e) => RetryResult::FatalErr(e),
    }
}
