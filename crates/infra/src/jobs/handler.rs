//! Handler contract and the registry the executor dispatches through.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::context::ExecutionContext;
use super::types::{Failure, Job};

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobResult {
    Success {
        result: JsonValue,
        metrics: JsonValue,
    },
    Failure {
        error: String,
        /// `false` dead-letters the job regardless of remaining attempts.
        retryable: bool,
    },
}

impl JobResult {
    pub fn success(result: JsonValue) -> Self {
        Self::Success {
            result,
            metrics: JsonValue::Object(Default::default()),
        }
    }

    pub fn success_with_metrics(result: JsonValue, metrics: JsonValue) -> Self {
        Self::Success { result, metrics }
    }

    /// Timeouts, 5xx, contention.
    pub fn transient(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retryable: true,
        }
    }

    /// Bad payload, unsupported input.
    pub fn permanent(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The failure to report, if this is one.
    pub fn as_failure(&self) -> Option<Failure> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, retryable } => Some(Failure {
                error: error.clone(),
                retryable: *retryable,
                detail: JsonValue::Null,
            }),
        }
    }
}

/// Executes jobs of one or more types.
///
/// Handlers must tolerate re-delivery: a job whose lease expires mid-run is
/// handed to another worker.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job, ctx: ExecutionContext) -> JobResult;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Job, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(Job, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, job: Job, ctx: ExecutionContext) -> JobResult {
        (self.f)(job, ctx).await
    }
}

/// `job_type` → handler.
///
/// Keys are exact job types, category patterns like `connector.*`, or the
/// `*` fallback.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("patterns", &keys).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; replaces any previous handler for `pattern`.
    pub fn register(&mut self, pattern: impl Into<String>, handler: impl JobHandler) -> &mut Self {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    pub fn register_arc(&mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(pattern.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Job, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.register(pattern, FnHandler::new(f))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Find the handler for `job_type`.
    ///
    /// Exact match first, then the longest matching `prefix.*` pattern, then `*`.
    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix('*')?;
                (prefix.ends_with('.') && job_type.starts_with(prefix))
                    .then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Some(h.clone());
        }

        self.handlers.get("*").cloned()
    }

    /// Job types with an exact registration, sorted.
    pub fn exact_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .keys()
            .filter(|k| !k.ends_with('*'))
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl JobHandler for Named {
        async fn handle(&self, _job: Job, _ctx: ExecutionContext) -> JobResult {
            JobResult::success(serde_json::json!(self.0))
        }
    }

    fn same(a: &Arc<dyn JobHandler>, b: &Arc<dyn JobHandler>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
    }

    #[test]
    fn resolve_prefers_exact_then_longest_category_then_wildcard() {
        let exact: Arc<dyn JobHandler> = Arc::new(Named("exact"));
        let connector: Arc<dyn JobHandler> = Arc::new(Named("connector"));
        let connector_sync: Arc<dyn JobHandler> = Arc::new(Named("connector.sync"));
        let any: Arc<dyn JobHandler> = Arc::new(Named("any"));

        let mut registry = HandlerRegistry::new();
        registry
            .register_arc("connector.sync.full", exact.clone())
            .register_arc("connector.*", connector.clone())
            .register_arc("connector.sync.*", connector_sync.clone())
            .register_arc("*", any.clone());

        assert!(same(&registry.resolve("connector.sync.full").unwrap(), &exact));
        assert!(same(&registry.resolve("connector.sync.delta").unwrap(), &connector_sync));
        assert!(same(&registry.resolve("connector.fetch").unwrap(), &connector));
        // "connectors" is not in the "connector." category
        assert!(same(&registry.resolve("connectors").unwrap(), &any));
        assert_eq!(registry.exact_types(), vec!["connector.sync.full".to_string()]);
    }

    #[test]
    fn resolve_without_fallback_returns_none() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("demo", |job, _ctx| async move { JobResult::success(job.payload) });
        assert!(registry.resolve("demo").is_some());
        assert!(registry.resolve("other").is_none());
    }

    #[test]
    fn failure_conversion() {
        let failure = JobResult::permanent("bad payload").as_failure().unwrap();
        assert!(!failure.retryable);
        assert_eq!(failure.error, "bad payload");
        assert!(JobResult::success(JsonValue::Null).as_failure().is_none());
    }
}
