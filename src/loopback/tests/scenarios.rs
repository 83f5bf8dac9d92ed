// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A Client talking to a Component through the loopback transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mplane_client::{Client, ClientError, TransportError};
use mplane_component::{AllowAll, Component, TokenPhase};
use mplane_dyncfg::ConfigSet;
use mplane_loopback::{LoopbackTransport, SleepService};
use mplane_ore::now::{tokio_clock, EpochMillis};
use mplane_protocol::{
    End, Envelope, PeerId, Reply, ResultMessage, Start, Token, Value, When, Withdrawal,
};
use tokio::time::Instant;

const T0: EpochMillis = 1_700_000_000_000;

struct Deployment {
    component: Arc<Component>,
    client: Client<LoopbackTransport>,
    configs: ConfigSet,
    identity: PeerId,
}

impl Deployment {
    async fn start() -> Deployment {
        let now = tokio_clock(T0);
        let configs =
            mplane_client::all_dyncfgs(mplane_component::all_dyncfgs(ConfigSet::default()));
        let component = Arc::new(Component::new(
            now.clone(),
            configs.clone(),
            Arc::new(AllowAll),
        ));
        component.add_service(Arc::new(SleepService::new("sleep", now.clone())));
        let identity = PeerId::from("component-1");
        let transport = LoopbackTransport::new(PeerId::from("client-1"))
            .with_component(identity.clone(), Arc::clone(&component));
        let client = Client::new(transport, now, configs.clone());
        assert_eq!(client.register(&identity).await.unwrap(), 1);
        Deployment {
            component,
            client,
            configs,
            identity,
        }
    }

    async fn sleep(&self, seconds: impl Into<Value>, when: When) -> Reply {
        let parameters = BTreeMap::from([("duration.s".to_owned(), seconds.into())]);
        self.client
            .invoke_capability("sleep", when, parameters, None)
            .await
            .unwrap()
    }

    fn phase(&self, token: &Token) -> Option<TokenPhase> {
        self.component
            .peer(self.client.transport().client())
            .phase(token)
    }
}

fn receipt_token(reply: &Reply) -> Token {
    match reply {
        Reply::Receipt(receipt) => receipt.token.clone(),
        other => panic!("expected receipt, got {other:?}"),
    }
}

fn result(reply: Reply) -> ResultMessage {
    match reply {
        Reply::Result(result) => result,
        other => panic!("expected result, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn receipt_then_result() {
    let d = Deployment::start().await;
    let reply = d.sleep(4u64, When::Immediate).await;
    let token = receipt_token(&reply);
    assert_eq!(d.client.registry().receipt_labels(), vec!["sleep-0".to_owned()]);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(d.client.result_for("sleep-0").await.unwrap(), reply);

    tokio::time::sleep(Duration::from_millis(1_001)).await;
    let result = result(d.client.result_for("sleep-0").await.unwrap());
    assert_eq!(result.token, token);
    assert_eq!(result.values["duration.s"], Value::from(4u64));
    assert_eq!(result.when, When::realized(T0, T0 + 4_000));
    assert!(d.client.registry().receipt_tokens().is_empty());
    assert_eq!(d.client.registry().result_labels(), vec!["sleep-0".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn interrupt_before_deferred_start() {
    let d = Deployment::start().await;
    let when = When::span(Start::At(T0 + 2_000), End::At(T0 + 10_000)).unwrap();
    let token = receipt_token(&d.sleep(100u64, when).await);
    assert_eq!(d.phase(&token), Some(TokenPhase::Pending));

    tokio::time::sleep(Duration::from_secs(1)).await;
    d.client.interrupt_capability("sleep-0").await.unwrap();

    tokio::time::sleep(Duration::from_millis(999)).await;
    assert!(matches!(
        d.client.result_for("sleep-0").await.unwrap(),
        Reply::Receipt(_)
    ));

    tokio::time::sleep(Duration::from_millis(2)).await;
    let result = result(d.client.result_for("sleep-0").await.unwrap());
    assert_eq!(result.values["duration.s"], Value::from(0u64));
    assert_eq!(result.when, When::realized(T0 + 2_000, T0 + 2_000));
}

#[tokio::test(start_paused = true)]
async fn interrupting_a_running_measurement() {
    let d = Deployment::start().await;
    d.sleep(100u64, When::Immediate).await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    d.client.interrupt_capability("sleep-0").await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let result = result(d.client.result_for("sleep-0").await.unwrap());
    // Noticed at the next once-a-second check.
    assert_eq!(result.values["duration.s"], Value::from(4u64));

    // Interrupts only apply to pending or running work.
    match d.client.interrupt_capability("sleep-0").await {
        Err(ClientError::Rejected(exception)) => assert_eq!(
            exception.message,
            "interrupt for specification not running"
        ),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(d.client.result_for("sleep-0").await.unwrap().token(), Some(&result.token));
}

#[tokio::test(start_paused = true)]
async fn withdrawn_capabilities_are_forgotten() {
    let d = Deployment::start().await;
    let token = d.client.registry().capability_tokens()[0].clone();

    let capability = d.component.remove_service(&token).unwrap();
    let outbound = d.component.outbound(d.client.transport().client());
    assert_eq!(outbound.len(), 1);
    for message in outbound {
        d.client
            .registry()
            .handle_message(message, &d.identity)
            .unwrap();
    }
    assert!(matches!(
        d.client.registry().capability_for(token.as_str()),
        Err(ClientError::NoSuchTokenOrLabel(_))
    ));

    // A repeated withdrawal is a no-op.
    d.client
        .registry()
        .handle_message(
            Withdrawal::new(capability).into(),
            &d.identity,
        )
        .unwrap();
    assert!(d.client.registry().capability_tokens().is_empty());
}

#[tokio::test(start_paused = true)]
async fn partial_results_do_not_end_redemption() {
    let d = Deployment::start().await;
    let when = When::span(Start::Now, End::At(T0 + 60_000)).unwrap();
    let token = receipt_token(&d.sleep(100u64, when).await);

    // A pushed result whose realized end is still ahead.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let partial = ResultMessage {
        token: token.clone(),
        label: Some("sleep-0".into()),
        when: When::realized(T0, T0 + 60_000),
        values: BTreeMap::from([("duration.s".to_owned(), Value::from(1u64))]),
    };
    d.client
        .registry()
        .handle_message(
            Envelope {
                messages: vec![partial.into()],
            }
            .into(),
            &d.identity,
        )
        .unwrap();
    assert_eq!(d.client.registry().receipt_tokens(), vec![token.clone()]);

    // The client still goes to the component for the outcome.
    d.client.transport().fail_next(&d.identity, 10);
    assert!(matches!(
        d.client.result_for(token.as_str()).await,
        Err(ClientError::Transport {
            source: TransportError::Unreachable(_),
            ..
        })
    ));
    assert!(matches!(
        d.client.result_for(token.as_str()).await.unwrap(),
        Reply::Receipt(_)
    ));

    tokio::time::sleep(Duration::from_secs(60)).await;
    let result = result(d.client.result_for(token.as_str()).await.unwrap());
    assert!(result.when.end_bound().unwrap() >= T0 + 60_000);
    assert!(d.client.registry().receipt_tokens().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resubmission_shares_one_invocation() {
    let d = Deployment::start().await;
    let first = d.sleep(2u64, When::Immediate).await;
    let second = d.sleep(2u64, When::Immediate).await;
    // Labels differ, tokens do not; the component answers with its first
    // receipt.
    assert_eq!(first, second);
    assert_eq!(d.client.registry().receipt_tokens().len(), 1);
    assert_eq!(d.client.result_for("sleep-1").await.unwrap(), first);

    tokio::time::sleep(Duration::from_millis(2_001)).await;
    let outcome = d.client.result_for("sleep-1").await.unwrap();
    assert!(matches!(outcome, Reply::Result(_)));
    assert_eq!(d.client.result_for("sleep-0").await.unwrap(), outcome);
    let again = d.sleep(2u64, When::Immediate).await;
    assert_eq!(outcome, again);
}

#[tokio::test(start_paused = true)]
async fn client_sweeper_purges_old_results() {
    let d = Deployment::start().await;
    let client = Arc::new(d.client);
    let _sweeper = client.spawn_sweeper();
    let parameters = BTreeMap::from([("duration.s".to_owned(), Value::from(1u64))]);
    client
        .invoke_capability("sleep", When::Immediate, parameters, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_001)).await;
    assert!(matches!(
        client.result_for("sleep-0").await.unwrap(),
        Reply::Result(_)
    ));

    // Ten minutes to expire, then up to one sweep interval to notice.
    tokio::time::sleep(Duration::from_secs(10 * 60 + 30)).await;
    assert!(client.registry().result_tokens().is_empty());
    assert!(matches!(
        client.result_for("sleep-0").await,
        Err(ClientError::NoSuchTokenOrLabel(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn unreachable_component_is_retried() {
    let d = Deployment::start().await;
    d.client.transport().fail_next(&d.identity, 3);
    let start = Instant::now();
    assert!(matches!(
        d.sleep(1u64, When::Immediate).await,
        Reply::Receipt(_)
    ));
    assert_eq!(start.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn lost_registration_is_restored() {
    let d = Deployment::start().await;
    d.client.transport().forget_registration(&d.identity);
    let start = Instant::now();
    assert!(matches!(
        d.sleep(1u64, When::Immediate).await,
        Reply::Receipt(_)
    ));
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(d.client.registry().capability_labels(), vec!["sleep".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn quick_results_skip_the_receipt() {
    let d = Deployment::start().await;
    mplane_component::dyncfgs::IMMEDIATE_REPLY_WINDOW.set(&d.configs, Duration::from_secs(5));

    let result = result(d.sleep(2u64, When::Immediate).await);
    assert_eq!(result.values["duration.s"], Value::from(2u64));
    assert!(d.client.registry().receipt_tokens().is_empty());
    assert_eq!(d.client.registry().result_labels(), vec!["sleep-0".to_owned()]);

    // Longer work still gets a receipt once the window closes.
    let start = Instant::now();
    assert!(matches!(
        d.sleep(10u64, When::Immediate).await,
        Reply::Receipt(_)
    ));
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn failed_measurements_become_exceptions() {
    let d = Deployment::start().await;
    d.sleep("a while", When::Immediate).await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    match d.client.result_for("sleep-0").await.unwrap() {
        Reply::Exception(exception) => {
            assert_eq!(exception.message, "duration.s must be a number")
        }
        other => panic!("expected exception, got {other:?}"),
    }
    assert_eq!(d.client.registry().result_labels(), vec!["sleep-0".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn silent_components_expire() {
    let d = Deployment::start().await;
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(d.client.expire_capabilities().is_empty());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(d.client.expire_capabilities().len(), 1);
    assert!(matches!(
        d.client
            .invoke_capability("sleep", When::Immediate, BTreeMap::new(), None)
            .await,
        Err(ClientError::NoSuchTokenOrLabel(_))
    ));

    d.client.register(&d.identity).await.unwrap();
    assert_eq!(d.client.registry().capability_labels(), vec!["sleep".to_owned()]);
}
