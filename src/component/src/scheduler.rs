// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The invocation scheduler.
//!
//! Per peer and token, an invocation moves through
//! `unseen -> pending -> running -> complete`. A specification is pending
//! from the moment it is accepted until its start time, running while its
//! service executes, and complete once the service's outcome is stored.
//! Completion is absorbing: re-delivering the specification, or redeeming
//! its token, returns the stored outcome without running anything again.
//!
//! Interrupts, whether sent by the peer or fired by the end of the
//! specification's temporal scope, only raise a flag that the service polls.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use mplane_dyncfg::ConfigSet;
use mplane_ore::now::NowFn;
use mplane_ore::task::{self, AbortOnDropHandle, JoinHandleExt};
use mplane_protocol::{
    Capability, Envelope, Message, PeerId, Receipt, Reply, Specification, Token, Withdrawal,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::authz::Authorization;
use crate::dyncfgs::{
    DELIVERED_RESULT_TTL, IMMEDIATE_REPLY_WINDOW, PEER_IDLE_TTL, SWEEP_INTERVAL,
    UNRETRIEVED_RESULT_TTL,
};
use crate::peer::PeerContext;
use crate::service::{InterruptCheck, Service};

/// What a call to [`Component::sweep`] purged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Stored outcomes purged.
    pub outcomes: usize,
    /// Idle peers purged.
    pub peers: usize,
}

/// A Component: a set of services, and the state of every peer invoking
/// them.
#[derive(Debug)]
pub struct Component {
    now: NowFn,
    config: ConfigSet,
    authz: Arc<dyn Authorization>,
    services: Mutex<Vec<Arc<dyn Service>>>,
    peers: Mutex<BTreeMap<PeerId, Arc<PeerContext>>>,
}

impl Component {
    /// Creates a Component with no services.
    ///
    /// `config` must contain the Component's configs, see
    /// [`crate::all_dyncfgs`].
    pub fn new(now: NowFn, config: ConfigSet, authz: Arc<dyn Authorization>) -> Component {
        Component {
            now,
            config,
            authz,
            services: Mutex::new(Vec::new()),
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    /// The Component's configuration.
    pub fn config(&self) -> &ConfigSet {
        &self.config
    }

    /// Binds a service. Specifications are matched against services in the
    /// order they were added.
    pub fn add_service(&self, service: Arc<dyn Service>) {
        let capability = service.capability();
        info!(
            label = capability.label.as_deref().unwrap_or(""),
            token = %capability.token(),
            "adding service"
        );
        self.services.lock().expect("lock poisoned").push(service);
    }

    /// Unbinds the service whose capability has `token`, and queues a
    /// withdrawal of that capability to every known peer authorized for it.
    ///
    /// Invocations already accepted are unaffected.
    pub fn remove_service(&self, token: &Token) -> Option<Capability> {
        let removed = {
            let mut services = self.services.lock().expect("lock poisoned");
            let idx = services
                .iter()
                .position(|s| s.capability().token() == *token)?;
            services.remove(idx)
        };
        let capability = removed.capability().clone();
        info!(%token, "removing service");
        for ctx in self.peers.lock().expect("lock poisoned").values() {
            if self.authz.authorized(&capability, ctx.peer()) {
                ctx.enqueue_outbound(Withdrawal::new(capability.clone()).into());
            }
        }
        Some(capability)
    }

    /// The tokens of all bound capabilities.
    pub fn capability_tokens(&self) -> Vec<Token> {
        self.capabilities().iter().map(Capability::token).collect()
    }

    /// The labels of all bound capabilities that have one.
    pub fn capability_labels(&self) -> Vec<String> {
        self.capabilities()
            .into_iter()
            .filter_map(|c| c.label)
            .collect()
    }

    /// The bound capability with the given token or label.
    pub fn capability_for(&self, token_or_label: &str) -> Option<Capability> {
        self.capabilities().into_iter().find(|c| {
            c.token().as_str() == token_or_label || c.label.as_deref() == Some(token_or_label)
        })
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.services
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|s| s.capability().clone())
            .collect()
    }

    /// The capabilities `peer` is authorized to see, as an envelope ready to
    /// be sent to it.
    pub fn capabilities_for(&self, peer: &PeerId) -> Envelope {
        self.peer(peer);
        let messages = self
            .capabilities()
            .into_iter()
            .filter(|c| self.authz.authorized(c, peer))
            .map(Message::from)
            .collect();
        Envelope { messages }
    }

    /// Returns the context for `peer`, creating it on first contact, and
    /// records that the peer was heard from.
    pub fn peer(&self, peer: &PeerId) -> Arc<PeerContext> {
        let now = self.now.as_millis();
        let ctx = Arc::clone(
            self.peers
                .lock()
                .expect("lock poisoned")
                .entry(peer.clone())
                .or_insert_with(|| {
                    debug!(%peer, "new peer");
                    Arc::new(PeerContext::new(peer.clone(), now))
                }),
        );
        ctx.touch(now);
        ctx
    }

    /// Handles one inbound message from `peer` and returns the reply.
    ///
    /// Never blocks on the completion of an invocation.
    pub fn handle(&self, peer: &PeerId, message: Message) -> Reply {
        let ctx = self.peer(peer);
        debug!(%peer, kind = message.kind(), "handling message");
        self.dispatch(&ctx, message)
    }

    /// Like [`Component::handle`], but when the reply would be a receipt,
    /// waits up to `mplane_immediate_reply_window` for the invocation to
    /// complete and replies with its outcome instead.
    pub async fn handle_and_wait(&self, peer: &PeerId, message: Message) -> Reply {
        let reply = self.handle(peer, message);
        let window = IMMEDIATE_REPLY_WINDOW.get(&self.config);
        let token = match &reply {
            Reply::Receipt(receipt) if !window.is_zero() => Some(receipt.token.clone()),
            _ => None,
        };
        let Some(token) = token else {
            return reply;
        };
        let ctx = self.peer(peer);
        ctx.wait_for_outcome(&token, window, || self.now.as_millis())
            .await
            .unwrap_or(reply)
    }

    /// Removes and returns the messages queued for `peer`: outcomes of
    /// completed invocations and withdrawals.
    pub fn outbound(&self, peer: &PeerId) -> Vec<Message> {
        let ctx = self.peers.lock().expect("lock poisoned").get(peer).cloned();
        ctx.map(|ctx| ctx.drain_outbound()).unwrap_or_default()
    }

    /// Notes that the transport lost its connection to `peer`.
    ///
    /// The peer's state is kept; the TTL sweep eventually purges it.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        if let Some(ctx) = self.peers.lock().expect("lock poisoned").get(peer) {
            info!(%peer, "peer disconnected");
            ctx.set_active(false);
        }
    }

    /// Discards all state for one of `peer`'s tokens.
    ///
    /// Returns false if the token was unknown.
    pub fn forget(&self, peer: &PeerId, token: &Token) -> bool {
        let ctx = self.peers.lock().expect("lock poisoned").get(peer).cloned();
        ctx.map_or(false, |ctx| ctx.reap(token))
    }

    /// Purges stored outcomes and idle peers that have outlived their TTLs.
    pub fn sweep(&self) -> SweepSummary {
        let now = self.now.as_millis();
        let delivered_ttl = DELIVERED_RESULT_TTL.get(&self.config);
        let unretrieved_ttl = UNRETRIEVED_RESULT_TTL.get(&self.config);
        let idle_ttl = PEER_IDLE_TTL.get(&self.config);

        let mut summary = SweepSummary::default();
        let mut peers = self.peers.lock().expect("lock poisoned");
        for ctx in peers.values() {
            summary.outcomes += ctx.sweep(now, delivered_ttl, unretrieved_ttl);
        }
        peers.retain(|peer, ctx| {
            let idle = ctx.is_idle(now, idle_ttl);
            if idle {
                info!(%peer, active = ctx.is_active(), "purging idle peer");
                summary.peers += 1;
            }
            !idle
        });
        if summary != SweepSummary::default() {
            debug!(?summary, "sweep complete");
        }
        summary
    }

    /// Spawns a task that calls [`Component::sweep`] every
    /// `mplane_sweep_interval`, until the Component or the handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> AbortOnDropHandle<()> {
        let component = Arc::downgrade(self);
        task::spawn(|| "component-sweeper", async move {
            loop {
                let interval = match component.upgrade() {
                    Some(component) => SWEEP_INTERVAL.get(&component.config),
                    None => return,
                };
                tokio::time::sleep(interval).await;
                match component.upgrade() {
                    Some(component) => {
                        component.sweep();
                    }
                    None => return,
                }
            }
        })
        .abort_on_drop()
    }

    fn dispatch(&self, ctx: &Arc<PeerContext>, message: Message) -> Reply {
        let now = self.now.as_millis();
        match message {
            Message::Envelope(envelope) => Reply::Envelope(
                envelope
                    .messages
                    .into_iter()
                    .map(|m| self.dispatch(ctx, m))
                    .collect(),
            ),
            Message::Specification(spec) => match ctx.reply_for(&spec.token(), now) {
                Some(reply) => reply,
                None => self.invoke(ctx, spec),
            },
            Message::Redemption(redemption) => ctx
                .reply_for(&redemption.token, now)
                .unwrap_or_else(|| {
                    let token = redemption.token;
                    warn!(peer = %ctx.peer(), %token, "redemption for unknown token");
                    Reply::exception(Some(token), "unknown token")
                }),
            Message::Interrupt(interrupt) => {
                if ctx.mark_interrupted(&interrupt.token) {
                    info!(peer = %ctx.peer(), token = %interrupt.token, "interrupted");
                    Reply::Interrupted(interrupt)
                } else {
                    warn!(
                        peer = %ctx.peer(),
                        token = %interrupt.token,
                        "interrupt for specification not running"
                    );
                    Reply::exception(
                        Some(interrupt.token),
                        "interrupt for specification not running",
                    )
                }
            }
            other => {
                warn!(peer = %ctx.peer(), kind = other.kind(), "unsupported message");
                Reply::exception(
                    other.token(),
                    format!("unsupported message for this role: {}", other.kind()),
                )
            }
        }
    }

    /// Accepts a new specification: matches it to a service, arms its
    /// timers, and launches it now or at its start time.
    fn invoke(&self, ctx: &Arc<PeerContext>, spec: Specification) -> Reply {
        let token = spec.token();
        let service = self
            .services
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|s| {
                spec.fulfills(s.capability()) && self.authz.authorized(s.capability(), ctx.peer())
            })
            .map(Arc::clone);
        let Some(service) = service else {
            warn!(peer = %ctx.peer(), %token, "no capability matches specification");
            return Reply::exception(Some(token), "no capability matches specification");
        };

        let now = self.now.as_millis();
        let Some(schedule) = spec.when.schedule(now) else {
            warn!(peer = %ctx.peer(), %token, when = %spec.when, "specification already expired");
            return Reply::exception(Some(token), "specification already expired");
        };

        let receipt = Receipt::for_specification(&spec);
        let interrupt = InterruptCheck::default();
        if let Err(existing) = ctx.record_receipt(receipt.clone(), interrupt.clone(), now) {
            return existing;
        }
        info!(
            peer = %ctx.peer(),
            %token,
            label = spec.label.as_deref().unwrap_or(""),
            when = %spec.when,
            "accepted specification"
        );

        if let Some(end_delay) = schedule.end_delay {
            let timer = task::spawn_delayed(
                || format!("end-of-scope-{token}"),
                end_delay,
                move || {
                    debug!("temporal scope ended");
                    interrupt.interrupt();
                },
            );
            ctx.record_timer(&token, timer);
        }

        if schedule.start_delay.is_zero() {
            launch(ctx, service, spec, self.now.clone());
        } else {
            let weak = Arc::downgrade(ctx);
            let now = self.now.clone();
            let timer = task::spawn_delayed(
                || format!("deferred-start-{token}"),
                schedule.start_delay,
                move || {
                    if let Some(ctx) = weak.upgrade() {
                        launch(&ctx, service, spec, now);
                    }
                },
            );
            ctx.record_timer(&token, timer);
        }
        Reply::Receipt(receipt)
    }
}

/// Starts `spec`'s unit of work, if its token is still pending.
///
/// The work runs as its own task. When it finishes, its outcome, or an
/// exception if it failed or panicked, is reconciled into the peer context.
fn launch(ctx: &Arc<PeerContext>, service: Arc<dyn Service>, spec: Specification, now: NowFn) {
    let token = spec.token();
    let span = info_span!("invocation", peer = %ctx.peer(), %token);
    let weak = Arc::downgrade(ctx);
    let launched = ctx.record_running(&token, |interrupt| {
        let token = token.clone();
        let name = format!("invocation-{token}");
        task::spawn(
            || name,
            async move {
                debug!("invocation started");
                let label = spec.label.clone();
                let run = AssertUnwindSafe(service.run(spec, interrupt))
                    .catch_unwind()
                    .await;
                let outcome = match run {
                    Ok(Ok(mut result)) => {
                        result.token = token.clone();
                        result.label = label;
                        info!(when = %result.when, "invocation complete");
                        Reply::Result(result)
                    }
                    Ok(Err(e)) => {
                        warn!("invocation failed: {e:#}");
                        Reply::exception(Some(token.clone()), format!("{e:#}"))
                    }
                    Err(panic) => {
                        let msg = panic_message(&*panic);
                        error!("invocation panicked: {msg}");
                        Reply::exception(Some(token.clone()), format!("service panicked: {msg}"))
                    }
                };
                if let Some(ctx) = weak.upgrade() {
                    ctx.record_outcome(&token, outcome, now.as_millis());
                }
            }
            .instrument(span),
        )
    });
    if !launched {
        debug!(peer = %ctx.peer(), %token, "not launching, no longer pending");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    match panic.downcast_ref::<&str>() {
        Some(s) => s,
        None => match panic.downcast_ref::<String>() {
            Some(s) => s.as_str(),
            None => "<unknown>",
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use mplane_dyncfg::ConfigUpdates;
    use mplane_ore::now::{tokio_clock, EpochMillis};
    use mplane_protocol::{
        Constraint, End, Interrupt, Redemption, ResultMessage, Start, Value, When, VERB_MEASURE,
    };

    use super::*;
    use crate::authz::{AllowAll, AllowList};
    use crate::peer::TokenPhase;

    const T0: EpochMillis = 1_700_000_000_000;

    /// Counts up once per second until interrupted or `count` is reached.
    #[derive(Debug)]
    struct Counter {
        capability: Capability,
        runs: Arc<AtomicUsize>,
        now: NowFn,
    }

    impl Counter {
        fn new(now: NowFn) -> Counter {
            Counter {
                capability: Capability::new(
                    VERB_MEASURE,
                    When::span(Start::Now, End::Future).unwrap(),
                )
                .with_label("counter")
                .with_parameter("count", Constraint::Any)
                .with_result("counted"),
                runs: Arc::new(AtomicUsize::new(0)),
                now,
            }
        }
    }

    #[async_trait]
    impl Service for Counter {
        fn capability(&self) -> &Capability {
            &self.capability
        }

        async fn run(
            &self,
            spec: Specification,
            interrupt: InterruptCheck,
        ) -> Result<ResultMessage, anyhow::Error> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let start = self.now.as_millis();
            let target = match spec.parameters.get("count") {
                Some(Value::Natural(n)) => *n,
                Some(Value::Text(t)) if t == "fail" => anyhow::bail!("asked to fail"),
                Some(Value::Text(t)) if t == "panic" => panic!("asked to panic"),
                _ => anyhow::bail!("count must be a natural number"),
            };
            let mut counted = 0;
            while counted < target && !interrupt.is_interrupted() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counted += 1;
            }
            Ok(
                ResultMessage::for_specification(&spec, When::realized(start, self.now.as_millis()))
                    .with_value("counted", counted),
            )
        }
    }

    struct Harness {
        component: Arc<Component>,
        runs: Arc<AtomicUsize>,
        capability: Capability,
        peer: PeerId,
    }

    fn harness_with(authz: Arc<dyn Authorization>) -> Harness {
        let now = tokio_clock(T0);
        let config = crate::all_dyncfgs(ConfigSet::default());
        let component = Arc::new(Component::new(now.clone(), config, authz));
        let counter = Counter::new(now);
        let runs = Arc::clone(&counter.runs);
        let capability = counter.capability.clone();
        component.add_service(Arc::new(counter));
        Harness {
            component,
            runs,
            capability,
            peer: "client-1".into(),
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(AllowAll))
    }

    impl Harness {
        fn spec(&self, count: impl Into<Value>, when: When) -> Specification {
            Specification::from_capability(
                &self.capability,
                when,
                [("count".to_string(), count.into())].into_iter().collect(),
                None,
            )
            .unwrap()
        }

        fn handle(&self, message: impl Into<Message>) -> Reply {
            self.component.handle(&self.peer, message.into())
        }

        fn redeem(&self, token: &Token) -> Reply {
            self.handle(Redemption {
                token: token.clone(),
                label: None,
            })
        }

        fn phase(&self, token: &Token) -> Option<TokenPhase> {
            self.component.peer(&self.peer).phase(token)
        }
    }

    fn exception_message(reply: &Reply) -> &str {
        match reply {
            Reply::Exception(e) => &e.message,
            other => panic!("expected exception, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_invocation_completes() {
        let h = harness();
        let spec = h.spec(3u64, When::Immediate);
        let token = spec.token();

        let reply = h.handle(spec.clone());
        assert!(matches!(&reply, Reply::Receipt(r) if r.token == token));
        assert_eq!(h.phase(&token), Some(TokenPhase::Running));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(matches!(h.redeem(&token), Reply::Receipt(_)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let Reply::Result(result) = h.redeem(&token) else {
            panic!("expected result");
        };
        assert_eq!(result.values["counted"], Value::Natural(3));
        assert_eq!(result.label.as_deref(), Some("counter"));
        assert_eq!(result.when, When::realized(T0, T0 + 3_000));

        // Complete is absorbing: resubmission returns the stored result.
        assert_eq!(h.handle(spec), Reply::Result(result.clone()));
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);

        // The outcome was also queued for push delivery.
        assert_eq!(
            h.component.outbound(&h.peer),
            vec![Message::Result(result)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_is_idempotent() {
        let h = harness();
        let spec = h.spec(5u64, When::Immediate);
        let first = h.handle(spec.clone());
        let second = h.handle(spec.clone());
        assert!(matches!(first, Reply::Receipt(_)));
        assert_eq!(first, second);

        // Inside an envelope, too.
        let Reply::Envelope(replies) = h.handle(Envelope {
            messages: vec![spec.clone().into(), spec.into()],
        }) else {
            panic!("expected envelope");
        };
        assert_eq!(replies, vec![first.clone(), first]);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_errors_leave_state_unchanged() {
        let h = harness();

        let expired = h.spec(
            1u64,
            When::span(Start::At(T0 - 10_000), End::At(T0 - 1)).unwrap(),
        );
        for _ in 0..2 {
            let reply = h.handle(expired.clone());
            assert_eq!(exception_message(&reply), "specification already expired");
            assert_eq!(reply.token(), Some(&expired.token()));
        }
        assert_eq!(h.phase(&expired.token()), None);

        let mut mismatched = h.spec(1u64, When::Immediate);
        mismatched.results.insert("other".into());
        let reply = h.handle(mismatched.clone());
        assert_eq!(
            exception_message(&reply),
            "no capability matches specification"
        );
        assert_eq!(h.phase(&mismatched.token()), None);

        let reply = h.redeem(&"nope".into());
        assert_eq!(exception_message(&reply), "unknown token");

        let reply = h.handle(Interrupt {
            token: "nope".into(),
            label: None,
        });
        assert_eq!(
            exception_message(&reply),
            "interrupt for specification not running"
        );

        let reply = h.handle(h.capability.clone());
        assert_eq!(
            exception_message(&reply),
            "unsupported message for this role: capability"
        );
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_peers_cannot_invoke_or_see() {
        let h = harness_with(Arc::new(AllowList::default().allow("counter", "client-2")));
        let spec = h.spec(1u64, When::Immediate);
        let reply = h.handle(spec.clone());
        assert_eq!(
            exception_message(&reply),
            "no capability matches specification"
        );
        assert!(h.component.capabilities_for(&h.peer).messages.is_empty());

        let other = PeerId::from("client-2");
        assert_eq!(h.component.capabilities_for(&other).messages.len(), 1);
        assert!(matches!(
            h.component.handle(&other, spec.into()),
            Reply::Receipt(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_start_and_early_interrupt() {
        let h = harness();
        let when = When::span(Start::At(T0 + 2_000), End::At(T0 + 10_000)).unwrap();
        let spec = h.spec(100u64, when);
        let token = spec.token();

        assert!(matches!(h.handle(spec), Reply::Receipt(_)));
        assert_eq!(h.phase(&token), Some(TokenPhase::Pending));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let interrupt = Interrupt {
            token: token.clone(),
            label: None,
        };
        assert_eq!(
            h.handle(interrupt.clone()),
            Reply::Interrupted(interrupt)
        );
        assert!(matches!(h.redeem(&token), Reply::Receipt(_)));
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        let Reply::Result(result) = h.redeem(&token) else {
            panic!("expected result");
        };
        assert_eq!(result.values["counted"], Value::Natural(0));
        assert_eq!(result.when, When::realized(T0 + 2_000, T0 + 2_000));
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_scope_interrupts() {
        let h = harness();
        let when = When::span(Start::Now, End::At(T0 + 4_500)).unwrap();
        let spec = h.spec(100u64, when);
        let token = spec.token();
        h.handle(spec);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!h.component.peer(&h.peer).is_interrupted(&token));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let Reply::Result(result) = h.redeem(&token) else {
            panic!("expected result");
        };
        // Interrupted at 4.5s, noticed after the fifth tick.
        assert_eq!(result.values["counted"], Value::Natural(5));

        let reply = h.handle(Interrupt {
            token,
            label: None,
        });
        assert_eq!(
            exception_message(&reply),
            "interrupt for specification not running"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_become_exceptions() {
        let h = harness();
        for (count, expected) in [
            ("fail", "asked to fail"),
            ("panic", "service panicked: asked to panic"),
        ] {
            let spec = h.spec(count, When::Immediate);
            let token = spec.token();
            assert!(matches!(h.handle(spec), Reply::Receipt(_)));
            tokio::time::sleep(Duration::from_millis(1)).await;
            let reply = h.redeem(&token);
            assert_eq!(exception_message(&reply), expected);
            assert_eq!(reply.token(), Some(&token));
            assert_eq!(h.phase(&token), Some(TokenPhase::Complete));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_reply_window() {
        let h = harness();
        let spec = h.spec(2u64, When::Immediate);
        let reply = h
            .component
            .handle_and_wait(&h.peer, spec.clone().into())
            .await;
        assert!(matches!(reply, Reply::Receipt(_)));

        let mut updates = ConfigUpdates::default();
        updates
            .add_parsed(h.component.config(), "mplane_immediate_reply_window", "5s")
            .unwrap();
        updates.apply(h.component.config());

        let spec = h.spec(3u64, When::Immediate);
        let reply = h.component.handle_and_wait(&h.peer, spec.into()).await;
        assert!(matches!(&reply, Reply::Result(r) if r.values["counted"] == Value::Natural(3)));

        let slow = h.spec(60u64, When::Immediate);
        let reply = h.component.handle_and_wait(&h.peer, slow.into()).await;
        assert!(matches!(reply, Reply::Receipt(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_purges_stale_state() {
        let h = harness();
        let delivered = h.spec(0u64, When::Immediate);
        let unretrieved = h.spec(1u64, When::Immediate);
        h.handle(delivered.clone());
        h.handle(unretrieved.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(h.redeem(&delivered.token()), Reply::Result(_)));

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(
            h.component.sweep(),
            SweepSummary {
                outcomes: 1,
                peers: 0
            }
        );
        assert_eq!(h.phase(&unretrieved.token()), None);

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(h.component.sweep().outcomes, 1);

        h.component.peer_disconnected(&h.peer);
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(h.component.sweep().peers, 1);
        assert!(h.component.outbound(&h.peer).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_periodically() {
        let h = harness();
        let _sweeper = h.component.spawn_sweeper();
        let spec = h.spec(0u64, When::Immediate);
        h.handle(spec.clone());
        tokio::time::sleep(Duration::from_secs(5 * 60 + 31)).await;
        assert_eq!(h.phase(&spec.token()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_service_withdraws_it() {
        let h = harness();
        let token = h.capability.token();
        assert_eq!(h.component.capability_tokens(), vec![token.clone()]);
        assert_eq!(h.component.capability_labels(), vec!["counter".to_string()]);
        assert_eq!(
            h.component.capability_for("counter"),
            Some(h.capability.clone())
        );
        assert_eq!(
            h.component.capability_for(token.as_str()),
            Some(h.capability.clone())
        );

        h.component.capabilities_for(&h.peer);
        assert_eq!(
            h.component.remove_service(&token),
            Some(h.capability.clone())
        );
        assert_eq!(h.component.remove_service(&token), None);
        assert_eq!(
            h.component.outbound(&h.peer),
            vec![Message::Withdrawal(Withdrawal::new(h.capability.clone()))]
        );
        assert!(h.component.capability_for("counter").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn forgetting_a_running_token() {
        let h = harness();
        let spec = h.spec(100u64, When::Immediate);
        let token = spec.token();
        h.handle(spec);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.component.forget(&h.peer, &token));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.phase(&token), None);
        assert_eq!(exception_message(&h.redeem(&token)), "unknown token");
        assert!(!h.component.forget(&h.peer, &token));
    }
}
