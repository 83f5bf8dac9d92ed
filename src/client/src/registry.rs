// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client-side record of what peers offer and what has come back.
//!
//! A [`Registry`] is plain synchronous state. It never talks to the network:
//! the caller feeds it every message received from a peer via
//! [`Registry::handle_message`] and asks it what to send next. The async
//! [`Client`](crate::Client) wraps it behind a mutex.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use mplane_ore::now::{EpochMillis, NowFn};
use mplane_protocol::{
    capabilities_matching_schema, Capability, Message, PeerId, ProtocolException, Receipt, Reply,
    ResultMessage, Specification, Token, Value, When, Withdrawal,
};
use tracing::{debug, info, warn};

use crate::error::ClientError;

#[derive(Debug, Clone)]
struct OfferedCapability {
    capability: Capability,
    identity: PeerId,
    last_seen: EpochMillis,
}

/// A specification this client sent, or heard about from a peer.
#[derive(Debug, Clone)]
struct Invocation {
    /// The peer it was sent to, for redemptions and interrupts.
    identity: PeerId,
    /// The labels it was sent under. Resubmitting an identical
    /// specification under a new label yields the same token.
    labels: BTreeSet<String>,
    updated_at: EpochMillis,
}

#[derive(Debug, Clone)]
enum Outcome {
    Result(ResultMessage),
    Exception(ProtocolException),
}

impl From<Outcome> for Reply {
    fn from(outcome: Outcome) -> Reply {
        match outcome {
            Outcome::Result(result) => Reply::Result(result),
            Outcome::Exception(exception) => Reply::Exception(exception),
        }
    }
}

/// Capabilities, receipts and results known to a client, indexed by token and
/// by label.
///
/// Labels are not unique. A label resolves to whatever was most recently
/// stored under it.
#[derive(Debug)]
pub struct Registry {
    now: NowFn,
    capabilities: BTreeMap<Token, OfferedCapability>,
    capability_labels: BTreeMap<String, Token>,
    identities: BTreeMap<PeerId, BTreeSet<Token>>,
    receipts: BTreeMap<Token, Receipt>,
    receipt_labels: BTreeMap<String, Token>,
    outcomes: BTreeMap<Token, Outcome>,
    outcome_labels: BTreeMap<String, Token>,
    invocations: BTreeMap<Token, Invocation>,
    outgoing: BTreeMap<PeerId, Vec<Message>>,
    next_serial: u64,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new(now: NowFn) -> Registry {
        Registry {
            now,
            capabilities: BTreeMap::new(),
            capability_labels: BTreeMap::new(),
            identities: BTreeMap::new(),
            receipts: BTreeMap::new(),
            receipt_labels: BTreeMap::new(),
            outcomes: BTreeMap::new(),
            outcome_labels: BTreeMap::new(),
            invocations: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            next_serial: 0,
        }
    }

    /// Processes a message received from `identity`.
    pub fn handle_message(
        &mut self,
        message: Message,
        identity: &PeerId,
    ) -> Result<(), ClientError> {
        self.handle(message, identity, false)
    }

    fn handle(
        &mut self,
        message: Message,
        identity: &PeerId,
        in_envelope: bool,
    ) -> Result<(), ClientError> {
        match message {
            Message::Capability(capability) => {
                self.add_capability(capability, identity);
                Ok(())
            }
            Message::Withdrawal(withdrawal) => {
                self.withdraw(&withdrawal, identity);
                Ok(())
            }
            Message::Receipt(receipt) => {
                self.add_receipt(receipt, identity);
                Ok(())
            }
            Message::Result(result) => {
                self.add_result(result, identity, in_envelope);
                Ok(())
            }
            Message::Exception(exception) => {
                self.add_exception(exception, identity);
                Ok(())
            }
            Message::Interrupt(interrupt) => {
                debug!(%identity, token = %interrupt.token, "interrupt acknowledged");
                Ok(())
            }
            Message::Envelope(envelope) => {
                for message in envelope.flatten() {
                    self.handle(message, identity, true)?;
                }
                Ok(())
            }
            message @ (Message::Specification(_) | Message::Redemption(_)) => {
                Err(ClientError::UnsupportedMessage(message.kind()))
            }
        }
    }

    fn add_capability(&mut self, capability: Capability, identity: &PeerId) {
        let token = capability.token();
        debug!(%identity, %token, label = ?capability.label, "capability offered");
        if let Some(label) = &capability.label {
            self.capability_labels.insert(label.clone(), token.clone());
        }
        self.identities
            .entry(identity.clone())
            .or_default()
            .insert(token.clone());
        self.capabilities.insert(
            token,
            OfferedCapability {
                capability,
                identity: identity.clone(),
                last_seen: self.now.as_millis(),
            },
        );
    }

    /// Removes the withdrawn capability: by exact token if known, otherwise
    /// every capability `identity` offers whose schema matches and whose
    /// constraints cover the withdrawn ones. Unknown withdrawals are ignored.
    fn withdraw(&mut self, withdrawal: &Withdrawal, identity: &PeerId) {
        let token = withdrawal.token();
        let doomed: Vec<Token> = if self.capabilities.contains_key(&token) {
            vec![token.clone()]
        } else {
            let offered = self
                .identities
                .get(identity)
                .into_iter()
                .flatten()
                .filter_map(|t| self.capabilities.get(t))
                .map(|offered| &offered.capability);
            capabilities_matching_schema(offered, &withdrawal.capability)
                .into_iter()
                .map(Capability::token)
                .collect()
        };
        if doomed.is_empty() {
            debug!(%identity, %token, "ignoring withdrawal of unknown capability");
        }
        for token in doomed {
            self.remove_capability(&token);
        }
    }

    fn remove_capability(&mut self, token: &Token) {
        let Some(offered) = self.capabilities.remove(token) else {
            return;
        };
        info!(identity = %offered.identity, %token, "capability withdrawn");
        if let Some(label) = &offered.capability.label {
            if self.capability_labels.get(label) == Some(token) {
                self.capability_labels.remove(label);
            }
        }
        if let Some(tokens) = self.identities.get_mut(&offered.identity) {
            tokens.remove(token);
            if tokens.is_empty() {
                self.identities.remove(&offered.identity);
            }
        }
    }

    /// Replaces everything `identity` offers with `capabilities`, as on
    /// (re-)registration. Returns how many capabilities it now offers.
    pub fn replace_offer(&mut self, identity: &PeerId, capabilities: Vec<Capability>) -> usize {
        let offered: BTreeSet<Token> = capabilities.iter().map(Capability::token).collect();
        let stale: Vec<Token> = self
            .identities
            .get(identity)
            .into_iter()
            .flatten()
            .filter(|t| !offered.contains(*t))
            .cloned()
            .collect();
        for token in stale {
            self.remove_capability(&token);
        }
        for capability in capabilities {
            self.add_capability(capability, identity);
        }
        offered.len()
    }

    fn add_receipt(&mut self, receipt: Receipt, identity: &PeerId) {
        // A receipt arriving after the final outcome is stale.
        if self.outcomes.contains_key(&receipt.token) && !self.receipts.contains_key(&receipt.token)
        {
            debug!(token = %receipt.token, "ignoring receipt for completed specification");
            return;
        }
        let token = receipt.token.clone();
        let invocation = self.touch_invocation(&token, identity, receipt.label.as_deref());
        for label in invocation.labels.clone() {
            self.receipt_labels.insert(label, token.clone());
        }
        self.receipts.insert(token, receipt);
    }

    /// Records that `token` was heard about from `identity` just now, under
    /// `label` if given.
    fn touch_invocation(
        &mut self,
        token: &Token,
        identity: &PeerId,
        label: Option<&str>,
    ) -> &Invocation {
        let now = self.now.as_millis();
        let invocation = self
            .invocations
            .entry(token.clone())
            .or_insert_with(|| Invocation {
                identity: identity.clone(),
                labels: BTreeSet::new(),
                updated_at: now,
            });
        invocation.updated_at = now;
        if let Some(label) = label {
            invocation.labels.insert(label.to_owned());
        }
        invocation
    }

    fn add_result(&mut self, mut result: ResultMessage, identity: &PeerId, in_envelope: bool) {
        let token = result.token.clone();
        let partial = in_envelope && !result.when.end_elapsed(self.now.as_millis());
        let receipt = if partial {
            self.receipts.get(&token).cloned()
        } else {
            self.take_receipt(&token)
        };
        if result.label.is_none() {
            result.label = receipt.and_then(|r| r.label);
        }
        debug!(%token, partial, "result received");
        let invocation = self.touch_invocation(&token, identity, result.label.as_deref());
        for label in invocation.labels.clone() {
            self.outcome_labels.insert(label, token.clone());
        }
        self.outcomes.insert(token, Outcome::Result(result));
    }

    fn add_exception(&mut self, exception: ProtocolException, identity: &PeerId) {
        let Some(token) = exception.token.clone() else {
            warn!(message = %exception.message, "exception without token");
            return;
        };
        match self.take_receipt(&token) {
            Some(receipt) => {
                let invocation = self.touch_invocation(&token, identity, receipt.label.as_deref());
                for label in invocation.labels.clone() {
                    self.outcome_labels.insert(label, token.clone());
                }
            }
            None => {
                warn!(%token, message = %exception.message, "exception for unknown receipt");
                self.touch_invocation(&token, identity, None);
            }
        }
        self.outcomes.insert(token, Outcome::Exception(exception));
    }

    fn take_receipt(&mut self, token: &Token) -> Option<Receipt> {
        let receipt = self.receipts.remove(token)?;
        self.receipt_labels.retain(|_, t| t != token);
        Some(receipt)
    }

    /// Derives a specification from the capability named by `token_or_label`,
    /// and returns it with the identity that offers the capability.
    ///
    /// Without `relabel`, the specification is labeled `<capability label>-<n>`
    /// with a serial number unique to this registry.
    pub fn spec_for(
        &mut self,
        token_or_label: &str,
        when: When,
        parameters: BTreeMap<String, Value>,
        relabel: Option<String>,
    ) -> Result<(PeerId, Specification), ClientError> {
        let offered = self.offered(token_or_label)?;
        let identity = offered.identity.clone();
        let label = match relabel {
            Some(label) => label,
            None => {
                let base = offered
                    .capability
                    .label
                    .as_deref()
                    .unwrap_or(&offered.capability.verb);
                format!("{base}-{}", self.next_serial)
            }
        };
        let spec =
            Specification::from_capability(&offered.capability, when, parameters, Some(label))?;
        self.next_serial += 1;
        self.touch_invocation(&spec.token(), &identity, spec.label.as_deref());
        Ok((identity, spec))
    }

    fn offered(&self, token_or_label: &str) -> Result<&OfferedCapability, ClientError> {
        resolve(&self.capabilities, &self.capability_labels, token_or_label)
            .ok_or_else(|| ClientError::NoSuchTokenOrLabel(token_or_label.to_owned()))
    }

    /// The capability named by `token_or_label`.
    pub fn capability_for(&self, token_or_label: &str) -> Result<&Capability, ClientError> {
        self.offered(token_or_label).map(|offered| &offered.capability)
    }

    /// The tokens of every known capability.
    pub fn capability_tokens(&self) -> Vec<Token> {
        self.capabilities.keys().cloned().collect()
    }

    /// The labels of every known capability.
    pub fn capability_labels(&self) -> Vec<String> {
        self.capability_labels.keys().cloned().collect()
    }

    /// The tokens of every specification still awaiting its final outcome.
    pub fn receipt_tokens(&self) -> Vec<Token> {
        self.receipts.keys().cloned().collect()
    }

    /// The labels of every specification still awaiting its final outcome.
    pub fn receipt_labels(&self) -> Vec<String> {
        self.receipt_labels.keys().cloned().collect()
    }

    /// The tokens of every stored result or exception.
    pub fn result_tokens(&self) -> Vec<Token> {
        self.outcomes.keys().cloned().collect()
    }

    /// The labels of every stored result or exception.
    pub fn result_labels(&self) -> Vec<String> {
        self.outcome_labels.keys().cloned().collect()
    }

    /// The identity a capability, receipt or result named by
    /// `token_or_label` belongs to.
    pub fn identity_for(&self, token_or_label: &str) -> Result<&PeerId, ClientError> {
        if let Ok(offered) = self.offered(token_or_label) {
            return Ok(&offered.identity);
        }
        let token = self.invocation_token(token_or_label)?;
        self.invocations
            .get(&token)
            .map(|invocation| &invocation.identity)
            .ok_or_else(|| ClientError::NoSuchTokenOrLabel(token_or_label.to_owned()))
    }

    fn invocation_token(&self, token_or_label: &str) -> Result<Token, ClientError> {
        let token = Token::from(token_or_label);
        if self.receipts.contains_key(&token) || self.outcomes.contains_key(&token) {
            return Ok(token);
        }
        self.receipt_labels
            .get(token_or_label)
            .or_else(|| self.outcome_labels.get(token_or_label))
            .cloned()
            .ok_or_else(|| ClientError::NoSuchTokenOrLabel(token_or_label.to_owned()))
    }

    /// What is currently known about the specification named by
    /// `token_or_label`.
    ///
    /// While a receipt is held, the answer is that receipt, even if partial
    /// results have arrived. Otherwise it is the stored result or exception.
    pub fn lookup(&self, token_or_label: &str) -> Result<Reply, ClientError> {
        let token = self.invocation_token(token_or_label)?;
        if let Some(receipt) = self.receipts.get(&token) {
            return Ok(Reply::Receipt(receipt.clone()));
        }
        self.outcomes
            .get(&token)
            .cloned()
            .map(Reply::from)
            .ok_or_else(|| ClientError::NoSuchTokenOrLabel(token_or_label.to_owned()))
    }

    /// Forgets every receipt and result stored under `token_or_label`.
    /// Returns whether anything was forgotten.
    pub fn forget(&mut self, token_or_label: &str) -> bool {
        let Ok(token) = self.invocation_token(token_or_label) else {
            return false;
        };
        self.purge(&token);
        true
    }

    fn purge(&mut self, token: &Token) {
        self.take_receipt(token);
        if self.outcomes.remove(token).is_some() {
            self.outcome_labels.retain(|_, t| t != token);
        }
        self.invocations.remove(token);
    }

    /// Purges results and exceptions, and specifications that were never
    /// answered, not heard about for `ttl`. Specifications still awaiting
    /// their outcome are kept. Also drops the outgoing queues of identities
    /// that no longer offer anything. Returns how many invocations were
    /// purged.
    pub fn sweep(&mut self, ttl: Duration) -> usize {
        let now = self.now.as_millis();
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let stale: Vec<Token> = self
            .invocations
            .iter()
            .filter(|(token, invocation)| {
                !self.receipts.contains_key(*token)
                    && invocation.updated_at.saturating_add(ttl) <= now
            })
            .map(|(token, _)| token.clone())
            .collect();
        for token in &stale {
            debug!(%token, "purging stale invocation");
            self.purge(token);
        }
        let identities = &self.identities;
        self.outgoing
            .retain(|identity, _| identities.contains_key(identity));
        stale.len()
    }

    /// Queues `message` for the identity to pick up on its next poll.
    pub fn push_outgoing(&mut self, identity: &PeerId, message: Message) {
        self.outgoing
            .entry(identity.clone())
            .or_default()
            .push(message);
    }

    /// Hands over everything queued for `identity`, refreshing the
    /// liveness of its capabilities.
    ///
    /// Fails if the identity offers no capabilities: it must register first.
    pub fn pull_outgoing(&mut self, identity: &PeerId) -> Result<Vec<Message>, ClientError> {
        if !self.identities.contains_key(identity) {
            return Err(ClientError::NotRegistered(identity.clone()));
        }
        self.refresh(identity);
        Ok(self.outgoing.remove(identity).unwrap_or_default())
    }

    /// Marks every capability `identity` offers as just seen.
    pub fn refresh(&mut self, identity: &PeerId) {
        let now = self.now.as_millis();
        for token in self.identities.get(identity).into_iter().flatten() {
            if let Some(offered) = self.capabilities.get_mut(token) {
                offered.last_seen = now;
            }
        }
    }

    /// Withdraws every capability whose offering peer has not been seen for
    /// `ttl`, as if the peer had withdrawn it. Returns the withdrawn tokens.
    pub fn expire_capabilities(&mut self, ttl: Duration) -> Vec<Token> {
        let now = self.now.as_millis();
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let stale: Vec<(PeerId, Capability)> = self
            .capabilities
            .values()
            .filter(|offered| offered.last_seen.saturating_add(ttl) <= now)
            .map(|offered| (offered.identity.clone(), offered.capability.clone()))
            .collect();
        let mut expired = Vec::with_capacity(stale.len());
        for (identity, capability) in stale {
            let withdrawal = Withdrawal::new(capability);
            info!(%identity, token = %withdrawal.token(), "capability timed out");
            expired.push(withdrawal.token());
            self.withdraw(&withdrawal, &identity);
        }
        expired
    }

    /// Withdraws every capability `identity` offers and drops its queue.
    pub fn identity_disconnected(&mut self, identity: &PeerId) {
        info!(%identity, "identity disconnected");
        let tokens = self.identities.get(identity).cloned().unwrap_or_default();
        for token in tokens {
            self.remove_capability(&token);
        }
        self.outgoing.remove(identity);
    }
}

fn resolve<'a, T>(
    by_token: &'a BTreeMap<Token, T>,
    by_label: &BTreeMap<String, Token>,
    token_or_label: &str,
) -> Option<&'a T> {
    by_token
        .get(&Token::from(token_or_label))
        .or_else(|| by_label.get(token_or_label).and_then(|t| by_token.get(t)))
}
