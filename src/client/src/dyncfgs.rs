// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dyncfgs used by the Client.

use std::time::Duration;

use mplane_dyncfg::{Config, ConfigSet};

/// How long a capability may go without its offering peer being seen before
/// it is treated as withdrawn.
pub const CAPABILITY_TTL: Config<Duration> = Config::new(
    "mplane_capability_ttl",
    Duration::from_secs(10),
    "How long a capability may go without its offering peer being seen before it is withdrawn.",
);

/// How long a result or exception is kept after it arrived.
pub const RESULT_TTL: Config<Duration> = Config::new(
    "mplane_client_result_ttl",
    Duration::from_secs(10 * 60),
    "How long the Client keeps a result or exception, or an unanswered specification, \
    after last hearing about it.",
);

/// The period of the Client's background sweep.
pub const SWEEP_INTERVAL: Config<Duration> = Config::new(
    "mplane_client_sweep_interval",
    Duration::from_secs(30),
    "The period of the Client's background sweep that expires capabilities and purges results.",
);

/// The fixed backoff between attempts to reach an unreachable peer.
pub const RETRY_BACKOFF: Config<Duration> = Config::new(
    "mplane_retry_backoff",
    Duration::from_secs(1),
    "The fixed backoff between attempts to reach an unreachable peer.",
);

/// How many attempts to make before giving up on an unreachable peer.
pub const RETRY_MAX_TRIES: Config<usize> = Config::new(
    "mplane_retry_max_tries",
    10,
    "How many attempts to make before giving up on an unreachable peer.",
);

/// Adds the full set of all Client `Config`s.
pub fn all_dyncfgs(configs: ConfigSet) -> ConfigSet {
    configs
        .add(&CAPABILITY_TTL)
        .add(&RESULT_TTL)
        .add(&SWEEP_INTERVAL)
        .add(&RETRY_BACKOFF)
        .add(&RETRY_MAX_TRIES)
}
