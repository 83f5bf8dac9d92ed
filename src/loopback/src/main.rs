// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs a Component and a Client in one process, invokes the sleep
//! measurement through them and prints its result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use mplane_client::Client;
use mplane_component::{AllowAll, Component};
use mplane_dyncfg::{ConfigSet, ConfigUpdates};
use mplane_loopback::{LoopbackTransport, SleepService};
use mplane_ore::cli::{self, KeyValueArg};
use mplane_ore::now::SYSTEM_TIME;
use mplane_ore::tracing::StderrLogConfig;
use mplane_protocol::{Message, PeerId, Reply, Value, When};
use tracing::info;
use tracing_subscriber::filter::Targets;

#[derive(Debug, clap::Parser)]
#[clap(about = "In-process mPlane component and client", long_about = None)]
struct Args {
    /// How many seconds the sleep measurement should sleep.
    #[clap(long, default_value = "2")]
    duration: f64,
    /// When to run the measurement, e.g. `now` or `now ... 2024-05-01 12:00:00`.
    #[clap(long, default_value = "now")]
    when: When,
    /// Which log messages to emit.
    #[clap(long, env = "MPLANE_LOG_FILTER", default_value = "info")]
    log_filter: Targets,
    /// Overrides for configuration values, as `NAME=VALUE`.
    #[clap(long = "config", value_name = "NAME=VALUE")]
    configs: Vec<KeyValueArg<String, String>>,
}

#[tokio::main]
async fn main() {
    let args: Args = cli::parse_args();
    if let Err(err) = run(args).await {
        eprintln!("mplane-loopback: fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    mplane_ore::tracing::configure(
        "mplane-loopback",
        StderrLogConfig {
            prefix: None,
            filter: args.log_filter,
        },
    )?;

    let configs = mplane_client::all_dyncfgs(mplane_component::all_dyncfgs(ConfigSet::default()));
    let mut updates = ConfigUpdates::default();
    for KeyValueArg { key, value } in &args.configs {
        updates.add_parsed(&configs, key, value)?;
    }
    updates.apply(&configs);

    let component = Arc::new(Component::new(
        SYSTEM_TIME.clone(),
        configs.clone(),
        Arc::new(AllowAll),
    ));
    component.add_service(Arc::new(SleepService::new("sleep", SYSTEM_TIME.clone())));
    let _sweeper = component.spawn_sweeper();

    let identity = PeerId::from("loopback-component");
    let transport = LoopbackTransport::new(PeerId::from("loopback-client"))
        .with_component(identity.clone(), Arc::clone(&component));
    let client = Arc::new(Client::new(transport, SYSTEM_TIME.clone(), configs));
    let _client_sweeper = client.spawn_sweeper();

    let offered = client.register(&identity).await?;
    info!(%identity, offered, "connected");

    let parameters = BTreeMap::from([("duration.s".to_owned(), Value::from(args.duration))]);
    let mut reply = client
        .invoke_capability("sleep", args.when, parameters, None)
        .await?;
    while let Reply::Receipt(receipt) = &reply {
        let token = receipt.token.clone();
        info!(%token, "waiting for result");
        tokio::time::sleep(Duration::from_secs(1)).await;
        reply = client.result_for(token.as_str()).await?;
    }
    match reply {
        Reply::Result(result) => {
            println!("{}", Message::from(result).to_json()?);
            Ok(())
        }
        Reply::Exception(exception) => bail!("measurement failed: {exception}"),
        reply => bail!("unexpected reply: {reply:?}"),
    }
}
