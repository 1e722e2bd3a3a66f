//! Per-key call orchestration: status tracking, deduplication, retry,
//! cancellation and cache-aware refresh.
//!
//! Every logical remote operation is addressed by a [`CallKey`]. The
//! registry keeps one [`CallState`] per key and notifies subscribers of that
//! key, in subscription order, after each transition. A generation counter
//! per key makes `cancel` and `reset` authoritative: once either runs, the
//! superseded execution can no longer write state.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, OnceLock},
    time::{Duration, SystemTime},
};

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cache::CacheStore,
    error::{CallError, CallResult},
    listeners::{ListenerMap, Subscription},
    retry::{RetryError, RetryExecutor, RetryPolicy},
};

/// Error text recorded when an in-flight call is cancelled.
pub const CANCELLED_MESSAGE: &str = "Request cancelled";

// ============================================================================
// Keys and state
// ============================================================================

/// Validated identifier of one logical remote operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallKey(String);

impl CallKey {
    /// Create a key, rejecting empty or whitespace-only input.
    pub fn new(key: impl Into<String>) -> CallResult<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(CallError::InvalidKey {
                message: "call key cannot be empty".to_string(),
            });
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for CallKey {
    type Error = CallError;

    fn try_from(value: &str) -> CallResult<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for CallKey {
    type Error = CallError;

    fn try_from(value: String) -> CallResult<Self> {
        Self::new(value)
    }
}

impl AsRef<str> for CallKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a call key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CallStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

impl CallStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Returns true for `Success` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Snapshot of one call key.
#[derive(Clone, Debug, PartialEq)]
pub struct CallState<T> {
    pub status: CallStatus,
    /// Last successful payload; kept across later loads and failures.
    pub data: Option<T>,
    /// Human-readable message of the last failure.
    pub error: Option<String>,
    /// Time of the last `Success` or `Error` transition.
    pub last_updated_at: Option<SystemTime>,
}

impl<T> Default for CallState<T> {
    fn default() -> Self {
        Self {
            status: CallStatus::Idle,
            data: None,
            error: None,
            last_updated_at: None,
        }
    }
}

// ============================================================================
// Options
// ============================================================================

type SuccessHook<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorHook = Box<dyn FnOnce(&CallError) + Send>;

/// Per-invocation options for [`CallRegistry::execute`].
pub struct CallOptions<T> {
    pub retry: RetryPolicy,
    on_success: Option<SuccessHook<T>>,
    on_error: Option<ErrorHook>,
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            on_success: None,
            on_error: None,
        }
    }
}

impl<T> CallOptions<T> {
    /// Three retries, 1s base delay, no hooks.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry.base_delay = delay;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.retry.jitter = jitter;
        self
    }

    /// Called once with the payload after a successful execution.
    #[must_use]
    pub fn on_success(mut self, hook: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    /// Called once with the terminal error of a failed execution.
    #[must_use]
    pub fn on_error(mut self, hook: impl FnOnce(&CallError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }
}

impl<T> fmt::Debug for CallOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("retry", &self.retry)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

struct CallEntry<T> {
    state: CallState<T>,
    generation: u64,
    cancel: Option<CancellationToken>,
}

impl<T> Default for CallEntry<T> {
    fn default() -> Self {
        Self {
            state: CallState::default(),
            generation: 0,
            cancel: None,
        }
    }
}

struct RegistryInner<T> {
    entries: Mutex<HashMap<CallKey, CallEntry<T>>>,
    listeners: Arc<ListenerMap<CallKey, CallState<T>>>,
    cache: Arc<CacheStore<T>>,
    // Serializes mutate-then-notify so listeners see transitions in order.
    // Reentrant so a listener may call back into the registry.
    notify: ReentrantMutex<()>,
}

/// Keyed call orchestrator.
///
/// Cloning is cheap; clones share state, listeners and cache.
pub struct CallRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for CallRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CallRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry<Value> {
    /// Process-wide registry over JSON payloads.
    pub fn global() -> &'static CallRegistry<Value> {
        static GLOBAL: OnceLock<CallRegistry<Value>> = OnceLock::new();
        GLOBAL.get_or_init(CallRegistry::new)
    }
}

impl<T> CallRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a registry with its own cache.
    pub fn new() -> Self {
        Self::with_cache(Arc::new(CacheStore::default()))
    }

    /// Create a registry that memoizes through `cache`.
    pub fn with_cache(cache: Arc<CacheStore<T>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                listeners: ListenerMap::new(),
                cache,
                notify: ReentrantMutex::new(()),
            }),
        }
    }

    /// Cache shared with work functions for memoization.
    pub fn cache(&self) -> &Arc<CacheStore<T>> {
        &self.inner.cache
    }

    /// Current state of `key`; Idle with no data for unseen keys.
    pub fn get_state(&self, key: &CallKey) -> CallState<T> {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.state.clone())
            .unwrap_or_default()
    }

    /// Listen to every transition of `key`.
    ///
    /// The listener is invoked once immediately with the current state.
    pub fn subscribe<F>(&self, key: &CallKey, listener: F) -> Subscription
    where
        F: Fn(&CallState<T>) + Send + Sync + 'static,
    {
        let _order = self.inner.notify.lock();
        let listener: Arc<dyn Fn(&CallState<T>) + Send + Sync> = Arc::new(listener);
        let subscription = self.inner.listeners.add(key.clone(), Arc::clone(&listener));
        crate::listeners::invoke_isolated(&listener, &self.get_state(key));
        subscription
    }

    /// Whether any listener is registered for `key`.
    pub fn has_listeners(&self, key: &CallKey) -> bool {
        self.inner.listeners.contains_key(key)
    }

    /// Run `work` under `key` with retry, tracking its status.
    ///
    /// Fails immediately with [`CallError::InProgress`] when the key is
    /// already loading, and with [`CallError::Other`] for an invalid retry
    /// policy. Returns [`CallError::Cancelled`] when `cancel` or `reset`
    /// superseded this execution; state is then left as they set it.
    /// Dropping the returned future cancels the execution.
    pub async fn execute<F, Fut>(
        &self,
        key: &CallKey,
        work: F,
        options: CallOptions<T>,
    ) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        let CallOptions {
            retry,
            on_success,
            on_error,
        } = options;
        retry
            .validate()
            .map_err(|reason| CallError::other(format!("Invalid retry policy: {reason}")))?;
        let token = CancellationToken::new();
        let generation = self.begin(key, &token)?;
        let guard = LoadingGuard {
            registry: self,
            key,
            generation,
            armed: true,
        };

        let executor = RetryExecutor::new(retry);
        let outcome = executor.run(work, CallError::is_retryable, &token).await;
        guard.disarm();

        let error = match outcome {
            Ok(data) => {
                let stored = data.clone();
                let applied = self.finish(key, generation, |state| {
                    state.status = CallStatus::Success;
                    state.data = Some(stored);
                    state.error = None;
                    state.last_updated_at = Some(SystemTime::now());
                });
                if !applied {
                    debug!(key = %key, "Discarding result of superseded call");
                    return Err(CallError::Cancelled);
                }
                if let Some(hook) = on_success {
                    hook(&data);
                }
                return Ok(data);
            }
            Err(RetryError::Cancelled) => return Err(CallError::Cancelled),
            Err(RetryError::Rejected { error, .. }) => error,
            Err(RetryError::Exhausted { attempts, last }) => CallError::RetriesExhausted {
                attempts,
                source: Box::new(last),
            },
        };

        let message = error.display_message();
        let applied = self.finish(key, generation, |state| {
            state.status = CallStatus::Error;
            state.error = Some(message);
            state.last_updated_at = Some(SystemTime::now());
        });
        if !applied {
            return Err(CallError::Cancelled);
        }
        if let Some(hook) = on_error {
            hook(&error);
        }
        Err(error)
    }

    /// Cancel the in-flight execution for `key`.
    ///
    /// No-op unless the key is loading. Returns whether anything was
    /// cancelled.
    pub fn cancel(&self, key: &CallKey) -> bool {
        self.cancel_loading(key, None)
    }

    /// Cancel `key` if loading and, when given, still on `generation`.
    fn cancel_loading(&self, key: &CallKey, generation: Option<u64>) -> bool {
        let cancelled = self.mutate(key, |entry| {
            if !entry.state.status.is_loading() {
                return None;
            }
            if generation.is_some_and(|generation| generation != entry.generation) {
                return None;
            }
            entry.generation += 1;
            entry.state.status = CallStatus::Idle;
            entry.state.error = Some(CANCELLED_MESSAGE.to_string());
            entry.cancel.take()
        });
        match cancelled {
            Some(token) => {
                token.cancel();
                info!(key = %key, "Call cancelled");
                true
            }
            None => false,
        }
    }

    /// Force `key` back to the default Idle state, cancelling any in-flight
    /// execution.
    pub fn reset(&self, key: &CallKey) {
        let token = self.mutate(key, |entry| {
            entry.generation += 1;
            entry.state = CallState::default();
            Some(entry.cancel.take())
        });
        if let Some(Some(token)) = token {
            token.cancel();
        }
    }

    /// Drop the cache entry for `key`, reset it, and execute again.
    pub async fn refresh<F, Fut>(
        &self,
        key: &CallKey,
        work: F,
        options: CallOptions<T>,
    ) -> CallResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        self.inner.cache.remove(key.as_str());
        self.reset(key);
        self.execute(key, work, options).await
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Enter Loading unless already loading. Returns the new generation.
    fn begin(&self, key: &CallKey, token: &CancellationToken) -> CallResult<u64> {
        let started = self.mutate(key, |entry| {
            if entry.state.status.is_loading() {
                return None;
            }
            entry.generation += 1;
            entry.cancel = Some(token.clone());
            entry.state.status = CallStatus::Loading;
            entry.state.error = None;
            Some(entry.generation)
        });
        started.ok_or_else(|| {
            debug!(key = %key, "Rejecting duplicate call");
            CallError::InProgress {
                key: key.to_string(),
            }
        })
    }

    /// Apply a terminal transition if `generation` is still current.
    fn finish(
        &self,
        key: &CallKey,
        generation: u64,
        apply: impl FnOnce(&mut CallState<T>),
    ) -> bool {
        self.mutate(key, |entry| {
            if entry.generation != generation {
                return None;
            }
            entry.cancel = None;
            apply(&mut entry.state);
            Some(())
        })
        .is_some()
    }

    /// Run `f` on the entry for `key`; when it returns `Some`, notify
    /// listeners with the resulting state after releasing the entry lock.
    fn mutate<R>(&self, key: &CallKey, f: impl FnOnce(&mut CallEntry<T>) -> Option<R>) -> Option<R> {
        let _order = self.inner.notify.lock();
        let (result, snapshot) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(key.clone()).or_default();
            let result = f(entry)?;
            (result, entry.state.clone())
        };
        self.inner.listeners.emit(key, &snapshot);
        Some(result)
    }
}

/// Cancels an execution whose future is dropped before it finishes, so the
/// key never stays loading.
struct LoadingGuard<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    registry: &'a CallRegistry<T>,
    key: &'a CallKey,
    generation: u64,
    armed: bool,
}

impl<T> LoadingGuard<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for LoadingGuard<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            self.registry.cancel_loading(self.key, Some(self.generation));
        }
    }
}

impl<T> fmt::Debug for CallRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRegistry")
            .field("keys", &self.inner.entries.lock().len())
            .finish()
    }
}
