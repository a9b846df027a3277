use crate::error::TidedbError;
use crate::sync::retry::ShouldRetry;
use crate::write::MutationContext;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Runs the mutation body locally. Receives the mutation context and the
/// caller's args; whatever it returns is persisted as the local resolver
/// result and handed to the remote resolver on push.
pub type LocalResolver =
    Arc<dyn Fn(&MutationContext<'_>, Value) -> Result<Value, TidedbError> + Send + Sync>;

pub type MutationFn = Arc<dyn Fn(Value) -> BoxFuture<Result<PushAck, TidedbError>> + Send + Sync>;

type SuccessHook = Arc<dyn Fn(&PushAck) + Send + Sync>;

/// The remote's acknowledgement of one pushed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub server_mutation_id: i64,
}

/// Remote half of a mutator: how to replay the mutation against the
/// server, when to give up, and what to do on acknowledgement.
#[derive(Clone)]
pub struct RemoteResolver {
    pub mutation_fn: MutationFn,
    pub should_retry: ShouldRetry,
    pub on_success: Option<SuccessHook>,
}

impl RemoteResolver {
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PushAck, TidedbError>> + Send + 'static,
    {
        Self {
            mutation_fn: Arc::new(move |args| Box::pin(mutation_fn(args))),
            should_retry: ShouldRetry::default(),
            on_success: None,
        }
    }

    pub fn should_retry(mut self, should_retry: impl Into<ShouldRetry>) -> Self {
        self.should_retry = should_retry.into();
        self
    }

    pub fn on_success(mut self, hook: impl Fn(&PushAck) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }
}

/// A registered mutator. Only `mutation_name` and `mutation_args` are ever
/// persisted; function references live here and nowhere else.
#[derive(Clone)]
pub struct MutatorDef {
    pub local: LocalResolver,
    pub remote: Option<RemoteResolver>,
}

impl MutatorDef {
    pub fn local(
        resolver: impl Fn(&MutationContext<'_>, Value) -> Result<Value, TidedbError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            local: Arc::new(resolver),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: RemoteResolver) -> Self {
        self.remote = Some(remote);
        self
    }
}

/// Name-keyed mutator registry, shared between the facade (dispatching
/// `mutate` calls) and the sync manager (replaying pushes).
#[derive(Default)]
pub struct MutatorRegistry {
    inner: Mutex<HashMap<String, Arc<MutatorDef>>>,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, def: MutatorDef) {
        self.inner.lock().insert(name.into(), Arc::new(def));
    }

    pub fn get(&self, name: &str) -> Option<Arc<MutatorDef>> {
        self.inner.lock().get(name).cloned()
    }
}
