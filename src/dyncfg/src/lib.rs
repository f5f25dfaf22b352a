// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dynamically updatable configuration.
//!
//! A typed static [`Config`] is declared next to the code that reads it. Each
//! process registers the configs it cares about into a [`ConfigSet`], whose
//! values are shared behind atomics so that readers always observe the
//! latest update without locking the whole set. Multiple sets are fully
//! independent, which keeps unit tests isolated from each other.
//!
//! ```
//! # use vdb_dyncfg::{Config, ConfigSet};
//! const FOO: Config<bool> = Config::new("foo", false, "description of foo");
//! fn bar(cfg: &ConfigSet) {
//!     assert_eq!(FOO.get(cfg), false);
//! }
//! let cfg = ConfigSet::default().add(&FOO);
//! bar(&cfg);
//! ```
//!
//! Values travel between sets (or from an operator) as [`ConfigUpdates`],
//! a plain serializable map from config name to [`ConfigValue`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// A handle to a dynamically updatable configuration value.
///
/// This represents a strongly-typed named config of type `T`. It may be
/// registered to a set of such configs with [ConfigSet::add] and then later
/// used to retrieve the latest value at any time with [Self::get].
///
/// The supported types are [bool], [u32], [usize], [f64], [String] and
/// [Duration].
#[derive(Clone, Debug)]
pub struct Config<T: ConfigType> {
    name: &'static str,
    desc: &'static str,
    default: T::Default,
}

impl<T: ConfigType> Config<T> {
    /// Constructs a handle for a config of type `T`.
    ///
    /// Names must be unique within a [ConfigSet].
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

    /// Overwrites the value of this config within the given set.
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
    /// A value of this type, sharable between config value updaters and
    /// config value retrievers.
    type Shared;

    /// Extracts the sharable value for a config of this type from a set.
    fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>>;

    /// Converts this type to its type-erased shared equivalent.
    fn to_val(val: &Self) -> ConfigVal;

    /// Retrieves the current config value from its sharable form.
    fn get(x: &Self::Shared) -> Self;

    /// Updates the sharable value for a config of this type to the given value.
    fn set(x: &Self::Shared, val: Self);
}

/// A set of [Config]s with values independent of other [ConfigSet]s (even if
/// they contain the same configs).
///
/// Cloning a set shares its values.
#[derive(Clone, Default)]
pub struct ConfigSet {
    configs: BTreeMap<String, ConfigEntry>,
}

impl ConfigSet {
    /// Adds the given config to this set, returning `Self` for chaining.
    ///
    /// Panics if a config with the same name has previously been registered
    /// to this set.
    pub fn add<T: ConfigType>(mut self, config: &Config<T>) -> Self {
        let entry = ConfigEntry {
            name: config.name,
            val: T::to_val(&Into::<T>::into(config.default.clone())),
        };
        if let Some(prev) = self.configs.insert(config.name.to_owned(), entry) {
            panic!("{} registered twice", prev.name);
        }
        self
    }

    /// Parses `val` according to the type of the named config and stores it.
    ///
    /// Used for `--config name=value` style overrides.
    pub fn set_from_str(&self, name: &str, val: &str) -> Result<(), ConfigError> {
        let entry = self
            .configs
            .get(name)
            .ok_or_else(|| ConfigError::Unknown(name.to_owned()))?;
        let parsed = ConfigValue::parse_like(entry.val(), val).ok_or_else(|| {
            ConfigError::Parse {
                name: name.to_owned(),
                val: val.to_owned(),
            }
        })?;
        parsed.store(entry.val()).map_err(|_| ConfigError::Parse {
            name: name.to_owned(),
            val: val.to_owned(),
        })
    }
}

/// An entry for a config in a [ConfigSet].
#[derive(Clone, Debug)]
struct ConfigEntry {
    name: &'static str,
    /// The value shared by every clone of the set.
    val: ConfigVal,
}

impl ConfigEntry {
    fn val(&self) -> &ConfigVal {
        &self.val
    }
}

/// A type-erased [ConfigType::Shared] for when a set of different types are
/// stored in a collection.
#[derive(Clone, Debug)]
pub enum ConfigVal {
    /// A `bool` shared value.
    Bool(Arc<AtomicBool>),
    /// A `u32` shared value.
    U32(Arc<AtomicU32>),
    /// A `usize` shared value.
    Usize(Arc<AtomicU64>),
    /// An `f64` shared value, stored as its bit pattern.
    F64(Arc<AtomicU64>),
    /// A `String` shared value.
    String(Arc<RwLock<String>>),
    /// A `Duration` shared value.
    Duration(Arc<RwLock<Duration>>),
}

/// A plain, serializable config value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigValue {
    /// A `bool` value.
    Bool(bool),
    /// A `u32` value.
    U32(u32),
    /// A `usize` value.
    Usize(usize),
    /// An `f64` value.
    F64(f64),
    /// A `String` value.
    String(String),
    /// A `Duration` value.
    Duration(Duration),
}

impl ConfigValue {
    /// Writes this value into `dst`, returning `self` back on a type mismatch.
    fn store(self, dst: &ConfigVal) -> Result<(), Self> {
        match (self, dst) {
            (ConfigValue::Bool(v), ConfigVal::Bool(dst)) => bool::set(dst, v),
            (ConfigValue::U32(v), ConfigVal::U32(dst)) => u32::set(dst, v),
            (ConfigValue::Usize(v), ConfigVal::Usize(dst)) => usize::set(dst, v),
            (ConfigValue::F64(v), ConfigVal::F64(dst)) => f64::set(dst, v),
            (ConfigValue::String(v), ConfigVal::String(dst)) => String::set(dst, v),
            (ConfigValue::Duration(v), ConfigVal::Duration(dst)) => Duration::set(dst, v),
            (v, _) => return Err(v),
        }
        Ok(())
    }

    fn parse_like(like: &ConfigVal, s: &str) -> Option<Self> {
        let val = match like {
            ConfigVal::Bool(_) => ConfigValue::Bool(s.parse().ok()?),
            ConfigVal::U32(_) => ConfigValue::U32(s.parse().ok()?),
            ConfigVal::Usize(_) => ConfigValue::Usize(s.parse().ok()?),
            ConfigVal::F64(_) => ConfigValue::F64(s.parse().ok()?),
            ConfigVal::String(_) => ConfigValue::String(s.to_owned()),
            ConfigVal::Duration(_) => ConfigValue::Duration(humantime::parse_duration(s).ok()?),
        };
        Some(val)
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(x) => write!(f, "{x}"),
            ConfigValue::U32(x) => write!(f, "{x}"),
            ConfigValue::Usize(x) => write!(f, "{x}"),
            ConfigValue::F64(x) => write!(f, "{x}"),
            ConfigValue::String(x) => write!(f, "{x}"),
            ConfigValue::Duration(x) => write!(f, "{}", humantime::format_duration(*x)),
        }
    }
}

/// Errors from string based config updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// No config with the given name is registered.
    Unknown(String),
    /// The value could not be parsed as the config's type.
    Parse {
        /// The config name.
        name: String,
        /// The rejected input.
        val: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Unknown(name) => write!(f, "unknown config: {name}"),
            ConfigError::Parse { name, val } => write!(f, "invalid value for {name}: {val:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// A batch of named value updates for the configs in a [ConfigSet].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdates {
    updates: BTreeMap<String, ConfigValue>,
}

impl ConfigUpdates {
    /// Adds a value for the named config, replacing any earlier value for it.
    pub fn add_dynamic(&mut self, name: &str, val: ConfigValue) {
        self.updates.insert(name.to_owned(), val);
    }

    /// Returns the number of updates in this batch.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Returns whether this batch contains no updates.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Applies these config updates to the given [ConfigSet].
    ///
    /// This doesn't need to be the same set that the value updates were added
    /// from. Updates for configs unknown to the set, and type mismatches, are
    /// skipped and logged.
    pub fn apply(&self, set: &ConfigSet) {
        for (name, val) in self.updates.iter() {
            let Some(entry) = set.configs.get(name) else {
                error!("config update {} {:?} not known set: {:?}", name, val, set);
                continue;
            };
            match val.clone().store(&entry.val) {
                Ok(()) => info!(config = %name, value = %val, "applied config update"),
                Err(val) => error!(
                    "config update {} type mismatch: {:?} vs {:?}",
                    name, val, entry.val
                ),
            }
        }
    }
}

mod impls {
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::SeqCst};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use vdb_ore::cast::CastFrom;

    use crate::{Config, ConfigSet, ConfigType, ConfigVal};

    macro_rules! shared_entry {
        ($config:expr, $vals:expr, $variant:ident, $ty:literal) => {{
            let entry = $vals.configs.get($config.name)?;
            match entry.val() {
                ConfigVal::$variant(x) => Some(x),
                x => panic!("expected {} value got {:?}", $ty, x),
            }
        }};
    }

    impl ConfigType for bool {
        type Default = bool;
        type Shared = AtomicBool;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            shared_entry!(config, vals, Bool, "bool")
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

    impl ConfigType for u32 {
        type Default = u32;
        type Shared = AtomicU32;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            shared_entry!(config, vals, U32, "u32")
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::U32(Arc::new((*val).into()))
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
            shared_entry!(config, vals, Usize, "usize")
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Usize(Arc::new(u64::cast_from(*val).into()))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(u64::cast_from(val), SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            usize::cast_from(x.load(SeqCst))
        }
    }

    impl ConfigType for f64 {
        type Default = f64;
        type Shared = AtomicU64;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            shared_entry!(config, vals, F64, "f64")
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::F64(Arc::new(val.to_bits().into()))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(val.to_bits(), SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            f64::from_bits(x.load(SeqCst))
        }
    }

    impl ConfigType for String {
        type Default = &'static str;
        type Shared = RwLock<String>;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            shared_entry!(config, vals, String, "String")
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
            shared_entry!(config, vals, Duration, "Duration")
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

    impl std::fmt::Debug for ConfigSet {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let ConfigSet { configs } = self;
            f.debug_map()
                .entries(configs.iter().map(|(name, val)| (name, val.val())))
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOL: Config<bool> = Config::new("bool", true, "");
    const USIZE: Config<usize> = Config::new("usize", 1, "");
    const RATE: Config<f64> = Config::new("rate", f64::INFINITY, "");
    const STRING: Config<String> = Config::new("string", "a", "");
    const TICK: Config<Duration> = Config::new("tick", Duration::from_millis(200), "");

    #[test]
    fn all_types() {
        let configs = ConfigSet::default()
            .add(&BOOL)
            .add(&USIZE)
            .add(&RATE)
            .add(&STRING)
            .add(&TICK);
        assert!(BOOL.get(&configs));
        assert_eq!(USIZE.get(&configs), 1);
        assert_eq!(RATE.get(&configs), f64::INFINITY);
        assert_eq!(STRING.get(&configs), "a");
        assert_eq!(TICK.get(&configs), Duration::from_millis(200));

        BOOL.set(&configs, false);
        USIZE.set(&configs, 2);
        RATE.set(&configs, 0.5);
        STRING.set(&configs, "b".to_owned());
        TICK.set(&configs, Duration::from_secs(1));
        assert!(!BOOL.get(&configs));
        assert_eq!(USIZE.get(&configs), 2);
        assert_eq!(RATE.get(&configs), 0.5);
        assert_eq!(STRING.get(&configs), "b");
        assert_eq!(TICK.get(&configs), Duration::from_secs(1));
    }

    #[test]
    fn config_sets_are_independent() {
        let c0 = ConfigSet::default().add(&USIZE);
        USIZE.set(&c0, 2);

        let c1 = ConfigSet::default().add(&USIZE);
        assert_eq!(USIZE.get(&c1), 1);
        USIZE.set(&c1, 3);
        assert_eq!(USIZE.get(&c0), 2);

        // Updates land only in the set they are applied to.
        let mut updates = ConfigUpdates::default();
        updates.add_dynamic("usize", ConfigValue::Usize(4));
        updates.apply(&c1);
        assert_eq!(USIZE.get(&c1), 4);
        assert_eq!(USIZE.get(&c0), 2);
    }

    #[test]
    fn updates_skip_unknown_and_mismatched() {
        let configs = ConfigSet::default().add(&USIZE).add(&BOOL);
        let mut updates = ConfigUpdates::default();
        updates.add_dynamic("usize", ConfigValue::Bool(false));
        updates.add_dynamic("missing", ConfigValue::U32(7));
        updates.add_dynamic("bool", ConfigValue::Bool(false));
        updates.apply(&configs);
        assert_eq!(USIZE.get(&configs), 1);
        assert!(!BOOL.get(&configs));
    }

    #[test]
    fn updates_serde() {
        let mut updates = ConfigUpdates::default();
        updates.add_dynamic("rate", ConfigValue::F64(1.0));
        updates.add_dynamic("rate", ConfigValue::F64(12.5));
        assert_eq!(updates.len(), 1);
        let json = serde_json::to_string(&updates).expect("serializable");
        let decoded: ConfigUpdates = serde_json::from_str(&json).expect("deserializable");

        let other = ConfigSet::default().add(&RATE).add(&TICK);
        decoded.apply(&other);
        assert_eq!(RATE.get(&other), 12.5);
        assert_eq!(TICK.get(&other), Duration::from_millis(200));
    }

    #[test]
    fn set_from_str() {
        let configs = ConfigSet::default().add(&TICK).add(&RATE).add(&BOOL);
        configs.set_from_str("tick", "50ms").expect("valid duration");
        configs.set_from_str("rate", "3.5").expect("valid float");
        assert_eq!(TICK.get(&configs), Duration::from_millis(50));
        assert_eq!(RATE.get(&configs), 3.5);
        assert_eq!(
            configs.set_from_str("bool", "maybe"),
            Err(ConfigError::Parse {
                name: "bool".into(),
                val: "maybe".into()
            })
        );
        assert_eq!(
            configs.set_from_str("nope", "1"),
            Err(ConfigError::Unknown("nope".into()))
        );
    }
}
