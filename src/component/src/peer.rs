// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-peer invocation state.
//!
//! A [`PeerContext`] holds everything the Component knows about one remote
//! peer: the state of each token the peer has submitted, the interrupt flag
//! of each pending or running invocation, and a queue of messages waiting to
//! be pushed to the peer.
//!
//! Each token is in exactly one state at a time, which makes
//! "pending, running, or complete, but never two of them" hold by
//! construction. All mutation happens under a single lock per peer, which
//! is never held across an await point.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use mplane_ore::now::EpochMillis;
use mplane_ore::task::AbortOnDropHandle;
use mplane_protocol::{Message, PeerId, Receipt, Reply, Token};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::service::InterruptCheck;

/// The externally visible phase of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    /// Accepted, waiting for its start time.
    Pending,
    /// Its unit of work has been launched.
    Running,
    /// Its outcome is stored.
    Complete,
}

#[derive(Debug)]
enum TokenState {
    Pending {
        receipt: Receipt,
        interrupt: InterruptCheck,
        timers: Vec<AbortOnDropHandle<()>>,
    },
    Running {
        receipt: Receipt,
        interrupt: InterruptCheck,
        task: JoinHandle<()>,
        timers: Vec<AbortOnDropHandle<()>>,
    },
    Complete {
        outcome: Reply,
        completed_at: EpochMillis,
        delivered: bool,
    },
}

impl TokenState {
    fn phase(&self) -> TokenPhase {
        match self {
            TokenState::Pending { .. } => TokenPhase::Pending,
            TokenState::Running { .. } => TokenPhase::Running,
            TokenState::Complete { .. } => TokenPhase::Complete,
        }
    }

    fn interrupt(&self) -> Option<&InterruptCheck> {
        match self {
            TokenState::Pending { interrupt, .. } | TokenState::Running { interrupt, .. } => {
                Some(interrupt)
            }
            TokenState::Complete { .. } => None,
        }
    }

    fn timers_mut(&mut self) -> Option<&mut Vec<AbortOnDropHandle<()>>> {
        match self {
            TokenState::Pending { timers, .. } | TokenState::Running { timers, .. } => {
                Some(timers)
            }
            TokenState::Complete { .. } => None,
        }
    }
}

#[derive(Debug)]
struct PeerState {
    tokens: BTreeMap<Token, TokenState>,
    last_seen: EpochMillis,
    active: bool,
}

impl PeerState {
    /// The reply for a token that is already known.
    ///
    /// A running token whose task has finished without reporting an outcome
    /// is completed here with an exception, since no outcome will ever
    /// arrive.
    fn reply_for(&mut self, token: &Token, now: EpochMillis) -> Option<Reply> {
        let state = self.tokens.get_mut(token)?;
        let orphaned = matches!(state, TokenState::Running { task, .. } if task.is_finished());
        if orphaned {
            warn!(%token, "invocation ended without an outcome");
            *state = TokenState::Complete {
                outcome: Reply::exception(
                    Some(token.clone()),
                    "invocation ended without an outcome",
                ),
                completed_at: now,
                delivered: false,
            };
        }
        match state {
            TokenState::Pending { receipt, .. } | TokenState::Running { receipt, .. } => {
                Some(Reply::Receipt(receipt.clone()))
            }
            TokenState::Complete {
                outcome, delivered, ..
            } => {
                *delivered = true;
                Some(outcome.clone())
            }
        }
    }
}

/// All in-flight state for one remote peer.
#[derive(Debug)]
pub struct PeerContext {
    peer: PeerId,
    state: Mutex<PeerState>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    completions: Notify,
}

impl PeerContext {
    /// Creates the context for a peer first seen at `now`.
    pub fn new(peer: PeerId, now: EpochMillis) -> PeerContext {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        PeerContext {
            peer,
            state: Mutex::new(PeerState {
                tokens: BTreeMap::new(),
                last_seen: now,
                active: true,
            }),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            completions: Notify::new(),
        }
    }

    /// The peer this context belongs to.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Records that the peer was heard from at `now`.
    pub fn touch(&self, now: EpochMillis) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.last_seen = state.last_seen.max(now);
        state.active = true;
    }

    /// Marks the peer as connected or disconnected.
    pub fn set_active(&self, active: bool) {
        self.state.lock().expect("lock poisoned").active = active;
    }

    /// Reports whether the peer is connected.
    pub fn is_active(&self) -> bool {
        self.state.lock().expect("lock poisoned").active
    }

    /// Appends a message to the outbound queue. Never blocks.
    pub fn enqueue_outbound(&self, message: Message) {
        if self.outbound_tx.send(message).is_err() {
            debug!(peer = %self.peer, "outbound queue closed, dropping message");
        }
    }

    /// Removes and returns every message waiting in the outbound queue.
    ///
    /// Outcomes handed out this way count as delivered.
    pub fn drain_outbound(&self) -> Vec<Message> {
        let mut drained = Vec::new();
        {
            let mut rx = self.outbound_rx.lock().expect("lock poisoned");
            while let Ok(message) = rx.try_recv() {
                drained.push(message);
            }
        }
        let mut state = self.state.lock().expect("lock poisoned");
        for message in &drained {
            if let Message::Result(_) | Message::Exception(_) = message {
                let Some(token) = message.token() else {
                    continue;
                };
                if let Some(TokenState::Complete { delivered, .. }) = state.tokens.get_mut(&token)
                {
                    *delivered = true;
                }
            }
        }
        drained
    }

    /// Records a receipt for a newly accepted token, in the pending state.
    ///
    /// If the token is already known, nothing changes and the reply for its
    /// current state is returned instead.
    pub fn record_receipt(
        &self,
        receipt: Receipt,
        interrupt: InterruptCheck,
        now: EpochMillis,
    ) -> Result<(), Reply> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(existing) = state.reply_for(&receipt.token, now) {
            return Err(existing);
        }
        state.tokens.insert(
            receipt.token.clone(),
            TokenState::Pending {
                receipt,
                interrupt,
                timers: Vec::new(),
            },
        );
        Ok(())
    }

    /// Attaches a timer to a pending or running token. The timer is
    /// cancelled when the token completes or is reaped, or immediately if the
    /// token is no longer pending or running.
    pub fn record_timer(&self, token: &Token, timer: AbortOnDropHandle<()>) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(timers) = state.tokens.get_mut(token).and_then(TokenState::timers_mut) {
            timers.push(timer);
        }
    }

    /// Transitions a pending token to running, using `launch` to start its
    /// unit of work with the token's interrupt flag.
    ///
    /// Returns false, without calling `launch`, if the token is not pending.
    pub fn record_running<F>(&self, token: &Token, launch: F) -> bool
    where
        F: FnOnce(InterruptCheck) -> JoinHandle<()>,
    {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.tokens.remove(token) {
            Some(TokenState::Pending {
                receipt,
                interrupt,
                timers,
            }) => {
                let task = launch(interrupt.clone());
                state.tokens.insert(
                    token.clone(),
                    TokenState::Running {
                        receipt,
                        interrupt,
                        task,
                        timers,
                    },
                );
                true
            }
            Some(other) => {
                state.tokens.insert(token.clone(), other);
                false
            }
            None => false,
        }
    }

    /// Stores the outcome of a token's unit of work, clears its receipt and
    /// timers, and queues the outcome for the peer.
    ///
    /// Returns false, discarding the outcome, if the token is not pending or
    /// running (for example because it was reaped).
    pub fn record_outcome(&self, token: &Token, outcome: Reply, now: EpochMillis) -> bool {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            let Some(entry) = state.tokens.get_mut(token) else {
                return false;
            };
            if entry.phase() == TokenPhase::Complete {
                return false;
            }
            *entry = TokenState::Complete {
                outcome: outcome.clone(),
                completed_at: now,
                delivered: false,
            };
        }
        self.enqueue_outbound(outcome.into());
        self.completions.notify_waiters();
        true
    }

    /// The reply for a known token: its receipt while pending or running,
    /// its outcome once complete. Handing out an outcome marks it delivered.
    pub fn reply_for(&self, token: &Token, now: EpochMillis) -> Option<Reply> {
        self.state
            .lock()
            .expect("lock poisoned")
            .reply_for(token, now)
    }

    /// The phase of a token, if it is known.
    pub fn phase(&self, token: &Token) -> Option<TokenPhase> {
        self.state
            .lock()
            .expect("lock poisoned")
            .tokens
            .get(token)
            .map(TokenState::phase)
    }

    /// Flags a pending or running token as interrupted.
    ///
    /// Returns false if the token is unknown or already complete.
    pub fn mark_interrupted(&self, token: &Token) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        match state.tokens.get(token).and_then(TokenState::interrupt) {
            Some(interrupt) => {
                interrupt.interrupt();
                true
            }
            None => false,
        }
    }

    /// Reports whether a pending or running token has been interrupted.
    pub fn is_interrupted(&self, token: &Token) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state
            .tokens
            .get(token)
            .and_then(TokenState::interrupt)
            .map_or(false, InterruptCheck::is_interrupted)
    }

    /// Removes all bookkeeping for a token.
    ///
    /// A reaped token that is still running is interrupted, and its eventual
    /// outcome is discarded. Returns false if the token was unknown.
    pub fn reap(&self, token: &Token) -> bool {
        let removed = self
            .state
            .lock()
            .expect("lock poisoned")
            .tokens
            .remove(token);
        match removed {
            Some(state) => {
                if let Some(interrupt) = state.interrupt() {
                    interrupt.interrupt();
                }
                true
            }
            None => false,
        }
    }

    /// Waits up to `window` for a token to complete, returning its outcome.
    ///
    /// Returns `None` if the token is unknown or still incomplete when the
    /// window closes.
    pub async fn wait_for_outcome(
        &self,
        token: &Token,
        window: Duration,
        now: impl Fn() -> EpochMillis,
    ) -> Option<Reply> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            // Created before checking, so a completion in between is not
            // missed.
            let notified = self.completions.notified();
            let reply = self.reply_for(token, now())?;
            if reply.is_terminal() {
                return Some(reply);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Purges complete tokens whose outcomes have outlived their TTL.
    ///
    /// Returns the number of tokens purged.
    pub fn sweep(
        &self,
        now: EpochMillis,
        delivered_ttl: Duration,
        unretrieved_ttl: Duration,
    ) -> usize {
        let mut state = self.state.lock().expect("lock poisoned");
        let before = state.tokens.len();
        state.tokens.retain(|token, entry| match entry {
            TokenState::Complete {
                completed_at,
                delivered,
                ..
            } => {
                let ttl = if *delivered {
                    delivered_ttl
                } else {
                    unretrieved_ttl
                };
                let keep = completed_at.saturating_add(millis(ttl)) > now;
                if !keep {
                    debug!(
                        peer = %self.peer,
                        %token,
                        delivered = *delivered,
                        "purging stale outcome"
                    );
                }
                keep
            }
            TokenState::Pending { .. } | TokenState::Running { .. } => true,
        });
        before - state.tokens.len()
    }

    /// Reports whether this peer has no pending or running work and has not
    /// been heard from for `idle_ttl`.
    pub fn is_idle(&self, now: EpochMillis, idle_ttl: Duration) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        let busy = state
            .tokens
            .values()
            .any(|entry| entry.phase() != TokenPhase::Complete);
        !busy && state.last_seen.saturating_add(millis(idle_ttl)) <= now
    }
}

fn millis(d: Duration) -> EpochMillis {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
