// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Named, typed, updatable configuration.
//!
//! Basic usage:
//! - A type-safe static `Config` is defined near where it is used.
//! - Each Component or Client registers the `Config`s it reads to its own
//!   `ConfigSet`. The values within a `ConfigSet` are shared by its clones,
//!   though multiple `ConfigSet`s may be created and each are completely
//!   independent (i.e. one in each unit test).
//! - A `ConfigSet` is plumbed around as necessary and may be used to get or
//!   set the value of `Config`.
//!
//! ```
//! # use mplane_dyncfg::{Config, ConfigSet};
//! const FOO: Config<bool> = Config::new("foo", false, "description of foo");
//! fn bar(cfg: &ConfigSet) {
//!     assert_eq!(FOO.get(&cfg), false);
//! }
//! fn main() {
//!     let cfg = ConfigSet::default().add(&FOO);
//!     bar(&cfg);
//! }
//! ```
//!
//! Values are changed in bulk through [`ConfigUpdates`], which is also how
//! command-line overrides of the form `NAME=VALUE` are applied.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::error;

/// A handle to an updatable configuration value.
///
/// This represents a strongly-typed named config of type `T`. It may be
/// registered to a set of such configs with [ConfigSet::add] and then later
/// used to retrieve the latest value at any time with [Self::get].
///
/// The supported types are [bool], [usize], [String], and [Duration].
#[derive(Clone, Debug)]
pub struct Config<T: ConfigType> {
    name: &'static str,
    desc: &'static str,
    default: T::Default,
}

impl<T: ConfigType> Config<T> {
    /// Constructs a handle for a config of type `T`.
    ///
    /// Names are expected to be unique within a process and are prefixed with
    /// `mplane_` by convention.
    pub const fn new(name: &'static str, default: T::Default, desc: &'static str) -> Self {
        Config {
            name,
            default,
            desc,
        }
    }

    /// The name of this config.
    pub fn name(&self) -> &str {
        self.name
    }

    /// The description of this config.
    pub fn desc(&self) -> &str {
        self.desc
    }

    /// The default value of this config.
    pub fn default(&self) -> &T::Default {
        &self.default
    }

    /// Returns the latest value of this config within the given set.
    ///
    /// Panics if this config was not previously registered to the set.
    pub fn get(&self, set: &ConfigSet) -> T {
        T::get(T::shared(self, set).expect("config should be registered to set"))
    }

    /// Sets the value of this config within the given set.
    ///
    /// Panics if this config was not previously registered to the set.
    pub fn set(&self, set: &ConfigSet, val: T) {
        T::set(
            T::shared(self, set).expect("config should be registered to set"),
            val,
        )
    }
}

/// A type usable as a [Config].
pub trait ConfigType: Sized {
    /// A const-compatible type suitable for use as the default value of configs
    /// of this type.
    type Default: Into<Self> + Clone;
    /// A value of this type, sharable between config value updaters and config
    /// value retrievers.
    type Shared;

    /// Extracts the sharable value for a config of this type from a set.
    fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>>;

    /// Converts this type to its type-erased enum equivalent.
    fn to_val(val: &Self) -> ConfigVal;

    /// Retrieves the current config value of this type from a value of its
    /// corresponding sharable type.
    fn get(x: &Self::Shared) -> Self;

    /// Updates the sharable value for a config of this type to the given value.
    fn set(x: &Self::Shared, val: Self);
}

/// An set of [Config]s with values independent of other [ConfigSet]s (even if
/// they contain the same configs).
#[derive(Clone, Default)]
pub struct ConfigSet {
    configs: BTreeMap<String, ConfigEntry>,
}

impl ConfigSet {
    /// Adds the given config to this set.
    ///
    /// Panics if a config with the same name has previously been registered to
    /// this set.
    pub fn add<T: ConfigType>(mut self, config: &Config<T>) -> Self {
        let config = ConfigEntry {
            name: config.name,
            desc: config.desc,
            default: T::to_val(&Into::<T>::into(config.default.clone())),
            val: T::to_val(&Into::<T>::into(config.default.clone())),
        };
        if let Some(prev) = self.configs.insert(config.name.to_owned(), config) {
            panic!("{} registered twice", prev.name);
        }
        self
    }

    /// Returns the configs currently registered to this set.
    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.configs.values()
    }

    /// Returns the config registered under `name`, if any.
    pub fn entry(&self, name: &str) -> Option<&ConfigEntry> {
        self.configs.get(name)
    }
}

impl fmt::Debug for ConfigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ConfigSet { configs } = self;
        f.debug_map()
            .entries(configs.iter().map(|(name, entry)| (name, entry.val())))
            .finish()
    }
}

/// An entry for a config in a [ConfigSet].
#[derive(Clone, Debug)]
pub struct ConfigEntry {
    name: &'static str,
    desc: &'static str,
    default: ConfigVal,
    val: ConfigVal,
}

impl ConfigEntry {
    /// The name of this config.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The description of this config.
    pub fn desc(&self) -> &'static str {
        self.desc
    }

    /// The default value of this config.
    ///
    /// This value is never updated.
    pub fn default(&self) -> &ConfigVal {
        &self.default
    }

    /// The sharable value of this config in the set.
    pub fn val(&self) -> &ConfigVal {
        &self.val
    }
}

/// A type-erased [ConfigType::Shared] for when set of different types are
/// stored in a collection.
#[derive(Clone, Debug)]
pub enum ConfigVal {
    /// A `bool` shared value.
    Bool(Arc<AtomicBool>),
    /// A `usize` shared value.
    Usize(Arc<AtomicU64>),
    /// A `String` shared value.
    String(Arc<RwLock<String>>),
    /// A 'Duration' shared value.
    Duration(Arc<RwLock<Duration>>),
}

impl ConfigVal {
    /// Takes a point-in-time copy of this value.
    pub fn snapshot(&self) -> ConfigValue {
        match self {
            ConfigVal::Bool(x) => ConfigValue::Bool(bool::get(x)),
            ConfigVal::Usize(x) => ConfigValue::Usize(usize::get(x)),
            ConfigVal::String(x) => ConfigValue::String(String::get(x)),
            ConfigVal::Duration(x) => ConfigValue::Duration(Duration::get(x)),
        }
    }
}

/// A point-in-time copy of a config value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    /// A `bool` value.
    Bool(bool),
    /// A `usize` value.
    Usize(usize),
    /// A `String` value.
    String(String),
    /// A `Duration` value.
    Duration(Duration),
}

/// An error parsing a config update.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No config with this name is registered to the set.
    #[error("unknown config: {0}")]
    Unknown(String),
    /// The raw value could not be parsed as the config's type.
    #[error("invalid value for config {name}: {reason}")]
    InvalidValue {
        /// The config's name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// A batch of value updates to [Config]s.
///
/// This can be used to copy values from one [ConfigSet] to another, or to
/// apply overrides supplied on the command line.
#[derive(Clone, Debug, Default)]
pub struct ConfigUpdates {
    updates: BTreeMap<String, ConfigValue>,
}

impl ConfigUpdates {
    /// Adds the current value of the given config to this set of updates.
    ///
    /// If a value of the same config has previously been added to these
    /// updates, replaces it.
    pub fn add(&mut self, config: &ConfigEntry) {
        self.updates
            .insert(config.name.to_owned(), config.val.snapshot());
    }

    /// Parses `raw` as a value for the config `name`, which must be registered
    /// to `set`, and adds it to these updates.
    ///
    /// Durations use the `humantime` format, e.g. `30s` or `5min`.
    pub fn add_parsed(
        &mut self,
        set: &ConfigSet,
        name: &str,
        raw: &str,
    ) -> Result<(), ConfigError> {
        let entry = set
            .entry(name)
            .ok_or_else(|| ConfigError::Unknown(name.to_owned()))?;
        let invalid = |reason: String| ConfigError::InvalidValue {
            name: name.to_owned(),
            reason,
        };
        let value = match entry.val() {
            ConfigVal::Bool(_) => ConfigValue::Bool(raw.parse().map_err(|e| invalid(format!("{e}")))?),
            ConfigVal::Usize(_) => {
                ConfigValue::Usize(raw.parse().map_err(|e| invalid(format!("{e}")))?)
            }
            ConfigVal::String(_) => ConfigValue::String(raw.to_owned()),
            ConfigVal::Duration(_) => ConfigValue::Duration(
                humantime::parse_duration(raw).map_err(|e| invalid(format!("{e}")))?,
            ),
        };
        self.updates.insert(name.to_owned(), value);
        Ok(())
    }

    /// Applies these config updates to the given [ConfigSet].
    ///
    /// The value updates for any configs unknown by the given set are skipped.
    /// Ditto for config type mismatches. Both are logged.
    pub fn apply(&self, set: &ConfigSet) {
        for (name, val) in self.updates.iter() {
            let Some(config) = set.configs.get(name) else {
                error!("config update {} {:?} not known set: {:?}", name, val, set);
                continue;
            };
            match (val, &config.val) {
                (ConfigValue::Bool(src), ConfigVal::Bool(dst)) => bool::set(dst, *src),
                (ConfigValue::Usize(src), ConfigVal::Usize(dst)) => usize::set(dst, *src),
                (ConfigValue::String(src), ConfigVal::String(dst)) => {
                    String::set(dst, src.clone())
                }
                (ConfigValue::Duration(src), ConfigVal::Duration(dst)) => {
                    Duration::set(dst, *src)
                }
                (src, dst) => error!(
                    "config update {} type mismatch: {:?} vs {:?}",
                    name, src, dst
                ),
            }
        }
    }
}

mod impls {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use crate::{Config, ConfigSet, ConfigType, ConfigVal};

    impl ConfigType for bool {
        type Default = bool;
        type Shared = AtomicBool;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            let entry = vals.configs.get(config.name)?;
            match entry.val() {
                ConfigVal::Bool(x) => Some(x),
                x => panic!("expected bool value got {:?}", x),
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Bool(Arc::new((*val).into()))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(val, SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            x.load(SeqCst)
        }
    }

    impl ConfigType for usize {
        type Default = usize;
        type Shared = AtomicU64;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            let entry = vals.configs.get(config.name)?;
            match entry.val() {
                ConfigVal::Usize(x) => Some(x),
                x => panic!("expected usize value got {:?}", x),
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Usize(Arc::new(AtomicU64::new(
                u64::try_from(*val).unwrap_or(u64::MAX),
            )))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(u64::try_from(val).unwrap_or(u64::MAX), SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            usize::try_from(x.load(SeqCst)).unwrap_or(usize::MAX)
        }
    }

    impl ConfigType for String {
        type Default = &'static str;
        type Shared = RwLock<String>;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            let entry = vals.configs.get(config.name)?;
            match entry.val() {
                ConfigVal::String(x) => Some(x),
                x => panic!("expected String value got {:?}", x),
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::String(Arc::new(RwLock::new(val.clone())))
        }
        fn set(x: &Self::Shared, val: Self) {
            *x.write().expect("lock poisoned") = val;
        }
        fn get(x: &Self::Shared) -> Self {
            x.read().expect("lock poisoned").clone()
        }
    }

    impl ConfigType for Duration {
        type Default = Duration;
        type Shared = RwLock<Duration>;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            let entry = vals.configs.get(config.name)?;
            match entry.val() {
                ConfigVal::Duration(x) => Some(x),
                x => panic!("expected Duration value got {:?}", x),
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Duration(Arc::new(RwLock::new(*val)))
        }
        fn set(x: &Self::Shared, val: Self) {
            *x.write().expect("lock poisoned") = val;
        }
        fn get(x: &Self::Shared) -> Self {
            *x.read().expect("lock poisoned")
        }
    }
}
