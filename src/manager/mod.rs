//! Conditions manager.
//!
//! The manager resolves the keys declared in a slice's content for one IOV, from
//! (in order) its IOV cache, the backing store and registered on-demand rules. It is
//! `Send + Sync`; share it with `Arc` and call `prepare` from any number of threads,
//! each with its own slice.

mod cache;
mod coalesce;
mod config;
mod rules;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, info_span, warn};

use crate::condition::{Condition, ConditionFlags, ConditionKey, ItemCode};
use crate::content::{DeclaredKey, KeyOrigin};
use crate::error::{CondResult, ResolutionError, ValidationError};
use crate::iov::{Iov, IovType, IovTypeRegistry};
use crate::result::{Diagnostic, ResolutionResult};
use crate::slice::ConditionsSlice;
use crate::storage::{ConditionStore, StorageError};

use cache::ConditionCache;
use coalesce::{FlightOutcome, LoadCoalescer, Role};

pub use config::ManagerConfig;
pub use rules::{ConditionRule, DerivationContext, FnRule};

/// Where a resolved condition came from, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Cache,
    Store,
    Rule,
}

/// Resolves condition keys for an IOV.
pub struct ConditionsManager {
    store: Arc<dyn ConditionStore>,
    cache: ConditionCache,
    coalescer: LoadCoalescer,
    rules: HashMap<ItemCode, Arc<dyn ConditionRule>>,
    iov_types: IovTypeRegistry,
    config: ManagerConfig,
}

impl ConditionsManager {
    /// Creates a manager over `store` with the default config.
    #[must_use]
    pub fn new(store: Arc<dyn ConditionStore>) -> Self {
        let config = ManagerConfig::default();
        Self {
            store,
            cache: ConditionCache::new(config.cache_capacity, config.max_entries_per_key),
            coalescer: LoadCoalescer::new(),
            rules: HashMap::new(),
            iov_types: IovTypeRegistry::default(),
            config,
        }
    }

    /// Creates a manager with an explicit config.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if the config is out of range.
    pub fn with_config(store: Arc<dyn ConditionStore>, config: ManagerConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self {
            cache: ConditionCache::new(config.cache_capacity, config.max_entries_per_key),
            config,
            ..Self::new(store)
        })
    }

    /// Registers the rule computing on-demand keys of `item`. Returns the rule it
    /// replaces, if any.
    pub fn register_rule(
        &mut self,
        item: ItemCode,
        rule: impl ConditionRule + 'static,
    ) -> Option<Arc<dyn ConditionRule>> {
        self.rules.insert(item, Arc::new(rule))
    }

    /// Looks up a registered IOV type by name.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownIovType` if the name is not registered.
    pub fn iov_type(&self, name: &str) -> Result<IovType, ValidationError> {
        self.iov_types.require(name)
    }

    /// Registers an IOV type (idempotent per name).
    pub fn register_iov_type(&mut self, name: &str) -> IovType {
        self.iov_types.register(name)
    }

    /// Registry of known IOV types.
    #[must_use]
    pub const fn iov_types(&self) -> &IovTypeRegistry {
        &self.iov_types
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Resolves every declared key of `slice` for `iov`.
    ///
    /// The slice is cleared and rebound to `iov` first. Keys that cannot be resolved
    /// are counted as missing with a diagnostic; the call itself never fails. The
    /// configured `prepare_timeout_ms`, if any, bounds the call.
    pub fn prepare(&self, iov: &Iov, slice: &mut ConditionsSlice) -> ResolutionResult {
        let deadline = self.config.prepare_timeout().map(|t| Instant::now() + t);
        self.resolve(iov, slice, deadline)
    }

    /// Like [`prepare`](Self::prepare), but keys not reached before `deadline` are
    /// reported missing with `Timeout`.
    pub fn prepare_until(&self, iov: &Iov, slice: &mut ConditionsSlice, deadline: Instant) -> ResolutionResult {
        self.resolve(iov, slice, Some(deadline))
    }

    /// Drops every cached window of `key`. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns `CondError::Internal` if the cache lock is poisoned.
    pub fn invalidate(&self, key: ConditionKey) -> CondResult<usize> {
        self.cache.invalidate(key)
    }

    /// Empties the IOV cache.
    ///
    /// # Errors
    ///
    /// Returns `CondError::Internal` if the cache lock is poisoned.
    pub fn clear_cache(&self) -> CondResult<()> {
        self.cache.clear()
    }

    /// Number of cached conditions.
    ///
    /// # Errors
    ///
    /// Returns `CondError::Internal` if the cache lock is poisoned.
    pub fn cache_len(&self) -> CondResult<usize> {
        self.cache.len()
    }

    fn resolve(&self, iov: &Iov, slice: &mut ConditionsSlice, deadline: Option<Instant>) -> ResolutionResult {
        let span = info_span!("prepare", slice = %slice.id(), iov = %iov);
        let _enter = span.enter();

        slice.reset(*iov);
        let content = Arc::clone(slice.content());
        let mut result = ResolutionResult::default();
        let mut store_down: Option<String> = None;
        let mut deferred: Vec<&DeclaredKey> = Vec::new();

        for declared in content.iter() {
            if declared.origin == KeyOrigin::Calculated {
                continue;
            }
            let key = declared.key;
            if expired(deadline) {
                result.record_missing(Diagnostic::for_key(key, ResolutionError::Timeout));
                continue;
            }

            match self.cache.lookup(key, iov) {
                Ok(Some(condition)) => {
                    debug!(%key, "selected from cache");
                    place(slice, condition, Source::Cache, &mut result);
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "cache lookup failed"),
            }

            if let Some(reason) = &store_down {
                result.record_missing(Diagnostic::for_key(
                    key,
                    ResolutionError::StoreUnavailable {
                        attempts: 0,
                        reason: reason.clone(),
                    },
                ));
                continue;
            }

            let outcome = self
                .coalescer
                .run(key, *iov, deadline, || self.load(key, iov, deadline));
            match outcome {
                Ok((FlightOutcome::Cached(condition), _) | (FlightOutcome::Loaded(condition), Role::Follower)) => {
                    debug!(%key, "selected from a concurrent load");
                    place(slice, condition, Source::Cache, &mut result);
                }
                Ok((FlightOutcome::Loaded(condition), Role::Leader)) => {
                    debug!(%key, validity = %condition.validity, "loaded from store");
                    place(slice, condition, Source::Store, &mut result);
                }
                Ok((FlightOutcome::NotFound, _)) => {
                    if declared.origin == KeyOrigin::OnDemand && self.rules.contains_key(&key.item) {
                        deferred.push(declared);
                    } else {
                        result.record_missing(Diagnostic::for_key(key, ResolutionError::UnresolvedKey { key }));
                    }
                }
                Ok((FlightOutcome::Failed { error, connection_lost }, _)) => {
                    if connection_lost {
                        warn!(%key, error = %error, "store connection lost; skipping the store for the rest of this prepare");
                        store_down = Some(error.to_string());
                    }
                    result.record_missing(Diagnostic::for_key(key, error));
                }
                Err(e) => {
                    warn!(%key, error = %e, "coalesced load failed");
                    result.record_missing(Diagnostic::for_key(
                        key,
                        ResolutionError::StoreUnavailable {
                            attempts: 0,
                            reason: e.to_string(),
                        },
                    ));
                }
            }
        }

        // Rules run after every stored key is in place so they can read them.
        for declared in deferred {
            let key = declared.key;
            if expired(deadline) {
                result.record_missing(Diagnostic::for_key(key, ResolutionError::Timeout));
                continue;
            }
            match self.derive(declared, iov, slice) {
                Ok(condition) => place(slice, condition, Source::Rule, &mut result),
                Err(error) => {
                    warn!(%key, error = %error, "on-demand rule failed");
                    result.record_missing(Diagnostic::for_key(key, error));
                }
            }
        }

        info!(
            selected = result.selected,
            loaded = result.loaded,
            computed = result.computed,
            missing = result.missing,
            "{result}"
        );
        result
    }

    /// Leader side of a coalesced load. Publishes to the cache before returning.
    fn load(&self, key: ConditionKey, iov: &Iov, deadline: Option<Instant>) -> FlightOutcome {
        // A flight for this key may have completed between our miss and now.
        if let Ok(Some(condition)) = self.cache.lookup(key, iov) {
            return FlightOutcome::Cached(condition);
        }

        let condition = match self.fetch(key, iov, deadline) {
            Ok(Some(condition)) => condition,
            Ok(None) => return FlightOutcome::NotFound,
            Err(outcome) => return outcome,
        };
        if condition.key != key {
            return FlightOutcome::failed(ResolutionError::malformed(
                format!("condition for {key}"),
                format!("condition for {}", condition.key),
            ));
        }
        if !condition.is_valid_for(iov) {
            return FlightOutcome::failed(ResolutionError::StaleCondition {
                key,
                validity: condition.validity.to_string(),
                requested: iov.to_string(),
            });
        }

        let condition = Arc::new(condition);
        match self.cache.insert(Arc::clone(&condition)) {
            Ok(dropped) if dropped > 0 => debug!(%key, dropped, "cache entries superseded or evicted"),
            Ok(_) => {}
            Err(e) => warn!(%key, error = %e, "failed to cache loaded condition"),
        }
        FlightOutcome::Loaded(condition)
    }

    /// Store lookup with retry on transient failures.
    fn fetch(&self, key: ConditionKey, iov: &Iov, deadline: Option<Instant>) -> Result<Option<Condition>, FlightOutcome> {
        let mut backoff = self.config.retry_backoff();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let err = match self.store.lookup(key, iov) {
                Ok(found) => return Ok(found),
                Err(e) => e,
            };

            if err.is_connection_loss() {
                return Err(FlightOutcome::Failed {
                    error: unavailable(attempts, &err),
                    connection_lost: true,
                });
            }
            if let StorageError::SerializationError(reason) = &err {
                return Err(FlightOutcome::failed(ResolutionError::malformed("condition", reason.clone())));
            }
            let retry_allowed = err.is_transient()
                && attempts <= self.config.store_retries
                && deadline.map_or(true, |d| Instant::now() + backoff < d);
            if !retry_allowed {
                return Err(FlightOutcome::failed(unavailable(attempts, &err)));
            }

            debug!(%key, attempts, backoff_ms = backoff.as_millis(), error = %err, "retrying store lookup");
            thread::sleep(backoff);
            backoff = backoff.saturating_mul(2);
        }
    }

    fn derive(&self, declared: &DeclaredKey, iov: &Iov, slice: &ConditionsSlice) -> Result<Arc<Condition>, ResolutionError> {
        let key = declared.key;
        let rule = self
            .rules
            .get(&key.item)
            .ok_or(ResolutionError::UnresolvedKey { key })?;

        let mut ctx = DerivationContext::new(slice, *iov);
        let payload = rule.compute(key, &mut ctx)?;
        let validity = ctx.validity();
        debug!(%key, rule = rule.name(), %validity, "computed on demand");

        let condition = Arc::new(Condition::derived(
            key,
            declared.name.clone(),
            validity,
            ConditionFlags::NONE,
            payload,
        ));
        if let Err(e) = self.cache.insert(Arc::clone(&condition)) {
            warn!(%key, error = %e, "failed to cache computed condition");
        }
        Ok(condition)
    }
}

impl fmt::Debug for ConditionsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rules: Vec<&str> = self.rules.values().map(|r| r.name()).collect();
        rules.sort_unstable();
        f.debug_struct("ConditionsManager")
            .field("config", &self.config)
            .field("rules", &rules)
            .finish_non_exhaustive()
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn unavailable(attempts: u32, err: &StorageError) -> ResolutionError {
    ResolutionError::StoreUnavailable {
        attempts,
        reason: err.to_string(),
    }
}

fn place(slice: &mut ConditionsSlice, condition: Arc<Condition>, source: Source, result: &mut ResolutionResult) {
    let key = condition.key;
    match slice.insert(condition) {
        Ok(()) => match source {
            Source::Cache => result.selected += 1,
            Source::Store => result.loaded += 1,
            Source::Rule => result.computed += 1,
        },
        Err(error) => result.record_missing(Diagnostic::for_key(key, error)),
    }
}
