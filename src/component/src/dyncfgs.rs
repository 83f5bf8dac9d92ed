// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dyncfgs used by the Component.

use std::time::Duration;

use mplane_dyncfg::{Config, ConfigSet};

/// How long a peer context with no pending or running work may go unseen
/// before it is purged.
pub const PEER_IDLE_TTL: Config<Duration> = Config::new(
    "mplane_peer_idle_ttl",
    Duration::from_secs(60 * 60),
    "How long a peer with no pending or running work may go unseen before its state is purged.",
);

/// How long a delivered outcome is kept for idempotent re-delivery.
pub const DELIVERED_RESULT_TTL: Config<Duration> = Config::new(
    "mplane_delivered_result_ttl",
    Duration::from_secs(10 * 60),
    "How long a result or exception already delivered to its peer is kept for re-delivery.",
);

/// How long an outcome that was never delivered is kept.
pub const UNRETRIEVED_RESULT_TTL: Config<Duration> = Config::new(
    "mplane_unretrieved_result_ttl",
    Duration::from_secs(5 * 60),
    "How long a result or exception that its peer never retrieved is kept.",
);

/// The period of the background TTL sweep.
pub const SWEEP_INTERVAL: Config<Duration> = Config::new(
    "mplane_sweep_interval",
    Duration::from_secs(30),
    "The period of the background sweep that purges stale peers and results.",
);

/// How long to wait for a fresh invocation so that its result can be
/// returned in place of a receipt.
pub const IMMEDIATE_REPLY_WINDOW: Config<Duration> = Config::new(
    "mplane_immediate_reply_window",
    Duration::ZERO,
    "How long to wait for a fresh invocation to complete so that its result, \
    rather than a receipt, is the reply. Zero disables the wait.",
);

/// Adds the full set of all Component `Config`s.
pub fn all_dyncfgs(configs: ConfigSet) -> ConfigSet {
    configs
        .add(&PEER_IDLE_TTL)
        .add(&DELIVERED_RESULT_TTL)
        .add(&UNRETRIEVED_RESULT_TTL)
        .add(&SWEEP_INTERVAL)
        .add(&IMMEDIATE_REPLY_WINDOW)
}
