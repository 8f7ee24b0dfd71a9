use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::types::{RunId, SessionId};

/// What a resolver may look at when deciding.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub input: Value,
    pub session_state: Map<String, Value>,
}

/// Decides at run time which members, tools or instructions apply.
pub trait Resolver<T>: Send + Sync + 'static {
    fn resolve(&self, ctx: ResolveContext) -> BoxFuture<'_, Result<T>>;

    /// Re-resolve on every call instead of once per run.
    fn volatile(&self) -> bool {
        false
    }
}

type ResolveFn<T> = dyn Fn(ResolveContext) -> BoxFuture<'static, Result<T>> + Send + Sync;

/// A resolver backed by a closure.
pub struct FnResolver<T> {
    f: Arc<ResolveFn<T>>,
    volatile: bool,
}

impl<T: Send + 'static> FnResolver<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ResolveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |ctx| Box::pin(f(ctx))),
            volatile: false,
        }
    }

    pub fn mark_volatile(mut self) -> Self {
        self.volatile = true;
        self
    }
}

impl<T: Send + 'static> Resolver<T> for FnResolver<T> {
    fn resolve(&self, ctx: ResolveContext) -> BoxFuture<'_, Result<T>> {
        (self.f)(ctx)
    }

    fn volatile(&self) -> bool {
        self.volatile
    }
}

/// Caches a resolver's answer per run id.
pub struct CachedResolver<T> {
    inner: Arc<dyn Resolver<T>>,
    cache: Mutex<HashMap<RunId, T>>,
}

impl<T: Clone + Send + Sync + 'static> CachedResolver<T> {
    pub fn new(inner: impl Resolver<T>) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<dyn Resolver<T>>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve for `ctx.run_id`, reusing an earlier answer unless the resolver is volatile.
    pub async fn get(&self, ctx: ResolveContext) -> Result<T> {
        let run_id = ctx.run_id.clone();
        if !self.inner.volatile() {
            let hit = self.lock()?.get(&run_id).cloned();
            if let Some(hit) = hit {
                return Ok(hit);
            }
        }

        let value = self.inner.resolve(ctx).await?;
        if !self.inner.volatile() {
            debug!(run_id = %run_id, "Caching resolved value");
            self.lock()?.insert(run_id, value.clone());
        }
        Ok(value)
    }

    /// Drop the cached answer for a run.
    pub fn forget(&self, run_id: &RunId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(run_id);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RunId, T>>> {
        self.cache
            .lock()
            .map_err(|e| EnsembleError::Config(format!("resolver cache poisoned: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(run: &str) -> ResolveContext {
        ResolveContext {
            run_id: RunId::from_str(run),
            session_id: SessionId::from_str("s"),
            input: Value::Null,
            session_state: Map::new(),
        }
    }

    fn counting(calls: Arc<AtomicUsize>) -> FnResolver<Vec<String>> {
        FnResolver::new(move |ctx: ResolveContext| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(vec![format!("{}-{}", ctx.run_id, n)]) }
        })
    }

    #[tokio::test]
    async fn caches_once_per_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cached = CachedResolver::new(counting(calls.clone()));

        let a1 = cached.get(ctx("a")).await.unwrap();
        let a2 = cached.get(ctx("a")).await.unwrap();
        let b = cached.get(ctx("b")).await.unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cached.forget(&RunId::from_str("a"));
        cached.get(ctx("a")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn volatile_resolves_every_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cached = CachedResolver::new(counting(calls.clone()).mark_volatile());
        cached.get(ctx("a")).await.unwrap();
        cached.get(ctx("a")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
