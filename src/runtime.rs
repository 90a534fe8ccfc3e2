//! Runtime context: a per-perform metadata bag job code can write to.
//!
//! The job interceptor creates one [`RuntimeContext`] per perform attempt,
//! seeded with a copy of the item's metadata, and runs the perform inside
//! [`RuntimeContext::scope`]. The job runner picks it up with
//! [`RuntimeContext::current`] and hands it to job code. When the perform
//! ends, anything new in the bag is merged into the published metadata
//! without overwriting keys the pipeline already set.
//!
//! Propagation uses a tokio task-local, so concurrently running jobs on
//! different tasks never see each other's context. Tasks spawned from
//! inside a perform do not inherit it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::model::Metadata;

tokio::task_local! {
    static CURRENT: RuntimeContext;
}

/// Handle to the metadata bag of one perform attempt.
///
/// Clones share the same bag.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    bag: Arc<Mutex<Metadata>>,
}

impl RuntimeContext {
    /// A new context holding a private copy of `seed`.
    pub fn new(seed: &Metadata) -> Self {
        Self {
            bag: Arc::new(Mutex::new(seed.clone())),
        }
    }

    /// An empty context not tied to any instrumented perform.
    pub fn detached() -> Self {
        Self::default()
    }

    /// The context of the perform running on the current task, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }

    /// Run `fut` with `ctx` installed as the current task's context.
    pub async fn scope<F: Future>(ctx: RuntimeContext, fut: F) -> F::Output {
        CURRENT.scope(ctx, fut).await
    }

    fn lock(&self) -> MutexGuard<'_, Metadata> {
        self.bag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Store `value` under `key`, returning the previous value.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.lock().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    /// A copy of the bag's current contents.
    pub fn snapshot(&self) -> Metadata {
        self.lock().clone()
    }

    /// Copy every key absent from `target` into it. Existing keys in
    /// `target` are never overwritten.
    pub fn merge_into(&self, target: &mut Metadata) {
        for (key, value) in self.lock().iter() {
            if !target.contains_key(key) {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
