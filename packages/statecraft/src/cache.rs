//! Action result cache.
//!
//! A cacheable request action (say `FetchUser { id: 7 }`) maps to the result
//! action the rest of the chain produced for it (`UserLoaded { .. }`). Keys
//! are structural: two request actions that compare equal share a slot.
//!
//! Entries expire logically. Once `now >= expires_at` an entry is invisible
//! to [`ActionCache::get`] and [`ActionCache::has`]; it is only physically
//! removed by [`ActionCache::purge_expired`] or when overwritten.
//!
//! # Usage
//!
//! ```ignore
//! let cache = CacheMiddleware::new()
//!     .cacheable::<FetchUser>()
//!     .cacheable_for::<FetchWeather>(Duration::from_secs(600));
//!
//! let store = Store::builder(state)
//!     .with_middleware(cache)
//!     .with_middleware(AsyncFlowMiddleware::new().register::<FetchUser>())
//!     .build()
//!     .await;
//! ```

use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::core::{Action, ActionRef, ActionType, StoreState};
use crate::error::StoreError;
use crate::logger::Logger;
use crate::middleware::{Middleware, Next};
use crate::store::Store;

/// How long a cached result lives unless its type says otherwise.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Source of the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Actions that can be used as cache keys.
pub trait CacheableAction: Action + Eq + Hash {}

impl<T: Action + Eq + Hash> CacheableAction for T {}

/// Structural key for a cacheable action.
#[derive(Clone)]
pub struct CacheKey {
    action: ActionRef,
    hash: u64,
    eq: fn(&ActionRef, &ActionRef) -> bool,
}

impl CacheKey {
    /// Key for a concrete action value.
    pub fn new<A: CacheableAction>(action: A) -> Self {
        let hash = structural_hash(&action);
        Self {
            action: ActionRef::new(action),
            hash,
            eq: structural_eq::<A>,
        }
    }

    /// Key for a type-erased action, if it is an `A`.
    pub fn from_ref<A: CacheableAction>(action: &ActionRef) -> Option<Self> {
        let hash = structural_hash(action.downcast_ref::<A>()?);
        Some(Self {
            action: action.clone(),
            hash,
            eq: structural_eq::<A>,
        })
    }

    /// The request action this key was built from.
    pub fn action(&self) -> &ActionRef {
        &self.action
    }
}

fn structural_hash<A: CacheableAction>(action: &A) -> u64 {
    let mut hasher = DefaultHasher::new();
    TypeId::of::<A>().hash(&mut hasher);
    action.hash(&mut hasher);
    hasher.finish()
}

fn structural_eq<A: CacheableAction>(a: &ActionRef, b: &ActionRef) -> bool {
    match (a.downcast_ref::<A>(), b.downcast_ref::<A>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.action.type_id() == other.action.type_id()
            && (self.eq)(&self.action, &other.action)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.action).finish()
    }
}

/// A stored result and when it stops being valid.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub expires_at: DateTime<Utc>,
    pub action: ActionRef,
}

impl CachedResult {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Concurrent, expiry-aware map from request action to result action.
pub struct ActionCache {
    entries: DashMap<CacheKey, CachedResult>,
    clock: Arc<dyn Clock>,
}

impl ActionCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// The unexpired result for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<ActionRef> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.action.clone())
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Store `result` for `key`, valid for `ttl` from now.
    pub fn put(&self, key: CacheKey, result: ActionRef, ttl: Duration) {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.entries.insert(
            key,
            CachedResult {
                expires_at,
                action: result,
            },
        );
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Physically drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for ActionCache {
    fn default() -> Self {
        Self::new()
    }
}

struct Registration {
    ttl: Duration,
    key: fn(&ActionRef) -> Option<CacheKey>,
}

/// Middleware that answers cacheable actions from an [`ActionCache`].
///
/// On a hit the cached result is sent down the rest of the chain in place
/// of the request, and returned. On a miss the request runs normally and
/// the action returned by the rest of the chain is stored.
///
/// A request whose result is itself a registered cacheable type is a usage
/// error and fails with [`StoreError::CacheRecursion`].
pub struct CacheMiddleware {
    cache: Arc<ActionCache>,
    registrations: HashMap<TypeId, Registration>,
    default_ttl: Duration,
    logger: Logger,
}

impl CacheMiddleware {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(ActionCache::new()),
            registrations: HashMap::new(),
            default_ttl: DEFAULT_CACHE_TTL,
            logger: Logger::tracing("statecraft::cache"),
        }
    }

    /// Use an existing cache (for sharing or inspection).
    pub fn with_cache(mut self, cache: Arc<ActionCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the cache with one reading time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = Arc::new(ActionCache::with_clock(clock));
        self
    }

    /// Lifetime for types registered with [`CacheMiddleware::cacheable`].
    ///
    /// Applies to registrations made after this call.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Cache results of `A` for the default lifetime.
    pub fn cacheable<A: CacheableAction>(self) -> Self {
        let ttl = self.default_ttl;
        self.cacheable_for::<A>(ttl)
    }

    /// Cache results of `A` for `ttl`.
    pub fn cacheable_for<A: CacheableAction>(mut self, ttl: Duration) -> Self {
        self.registrations.insert(
            ActionType::of::<A>().id(),
            Registration {
                ttl,
                key: CacheKey::from_ref::<A>,
            },
        );
        self
    }

    pub fn cache(&self) -> &Arc<ActionCache> {
        &self.cache
    }

    fn is_cacheable(&self, action: &ActionRef) -> bool {
        self.registrations.contains_key(&action.type_id())
    }
}

impl Default for CacheMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: StoreState> Middleware<S> for CacheMiddleware {
    async fn handle(
        &self,
        _store: &Store<S>,
        action: ActionRef,
        next: Next<'_, S>,
    ) -> Result<ActionRef, StoreError> {
        let Some(registration) = self.registrations.get(&action.type_id()) else {
            return next.run(action).await;
        };
        let Some(key) = (registration.key)(&action) else {
            return next.run(action).await;
        };

        if let Some(hit) = self.cache.get(&key) {
            self.logger.debug(
                "cache hit for {action}, replaying {result}",
                &[&action.type_name(), &hit.type_name()],
            );
            next.run(hit.clone()).await?;
            return Ok(hit);
        }

        let result = next.run(action.clone()).await?;

        // Nothing downstream produced a result.
        if result.ptr_eq(&action) {
            return Ok(result);
        }

        if self.is_cacheable(&result) {
            return Err(StoreError::CacheRecursion {
                action: action.type_name(),
                result: result.type_name(),
            });
        }

        self.logger.trace(
            "caching {result} for {action}",
            &[&result.type_name(), &action.type_name()],
        );
        self.cache.put(key, result.clone(), registration.ttl);
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "CacheMiddleware"
    }
}
