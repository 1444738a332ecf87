//! Work item handlers
//!
//! A [`WorkItemHandler`] processes one item and may emit a follow-up item
//! that is enqueued in the same transaction. Handlers are produced by a
//! [`HandlerFactory`] and shared according to the configured
//! [`HandlerMode`].

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::store::WorkItem;

/// Error returned by a handler
///
/// Any handler error is fatal to the worker that invoked it.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The item payload could not be interpreted
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// Processing failed
    #[error("handler failed: {0}")]
    Failed(String),

    /// Any other failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Processes work items
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    /// Handle one item, optionally returning a follow-up item
    async fn handle(&self, item: WorkItem) -> Result<Option<WorkItem>, HandlerError>;
}

/// Produces handlers for queues
pub trait HandlerFactory: Send + Sync + 'static {
    /// Create a handler that will serve `queue`
    fn create(&self, queue: &str) -> Arc<dyn WorkItemHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&str) -> Arc<dyn WorkItemHandler> + Send + Sync + 'static,
{
    fn create(&self, queue: &str) -> Arc<dyn WorkItemHandler> {
        self(queue)
    }
}

/// Adapter turning an async closure into a [`WorkItemHandler`]
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a shareable handler
///
/// ```ignore
/// let handler = handler_fn(|item: WorkItem| async move {
///     println!("{}", item.payload);
///     Ok(None)
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn WorkItemHandler>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<WorkItem>, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

#[async_trait]
impl<F, Fut> WorkItemHandler for FnHandler<F, Fut>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<WorkItem>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, item: WorkItem) -> Result<Option<WorkItem>, HandlerError> {
        (self.f)(item).await
    }
}

/// How handler instances are shared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerMode {
    /// One handler for the whole engine
    Singleton,
    /// One cached handler per queue, evicted when the queue retires
    #[default]
    PerQueue,
    /// A fresh handler for every item
    PerWorkItem,
}

impl std::str::FromStr for HandlerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "singleton" => Ok(Self::Singleton),
            "per_queue" => Ok(Self::PerQueue),
            "per_work_item" | "per_item" => Ok(Self::PerWorkItem),
            other => Err(format!("unknown handler mode: {other}")),
        }
    }
}

/// Resolves the handler for a queue according to a [`HandlerMode`]
pub enum HandlerResolver {
    Singleton {
        factory: Arc<dyn HandlerFactory>,
        instance: OnceLock<Arc<dyn WorkItemHandler>>,
    },
    PerQueue {
        factory: Arc<dyn HandlerFactory>,
        cache: DashMap<String, Arc<dyn WorkItemHandler>>,
    },
    PerWorkItem {
        factory: Arc<dyn HandlerFactory>,
    },
}

impl std::fmt::Debug for HandlerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerResolver")
            .field("mode", &self.mode())
            .field("cached", &self.cached_count())
            .finish()
    }
}

impl HandlerResolver {
    /// Create a resolver for `mode` backed by `factory`
    pub fn new(mode: HandlerMode, factory: Arc<dyn HandlerFactory>) -> Self {
        match mode {
            HandlerMode::Singleton => Self::Singleton {
                factory,
                instance: OnceLock::new(),
            },
            HandlerMode::PerQueue => Self::PerQueue {
                factory,
                cache: DashMap::new(),
            },
            HandlerMode::PerWorkItem => Self::PerWorkItem { factory },
        }
    }

    /// The mode this resolver implements
    pub fn mode(&self) -> HandlerMode {
        match self {
            Self::Singleton { .. } => HandlerMode::Singleton,
            Self::PerQueue { .. } => HandlerMode::PerQueue,
            Self::PerWorkItem { .. } => HandlerMode::PerWorkItem,
        }
    }

    /// Handler to use for the next item of `queue`
    pub fn resolve(&self, queue: &str) -> Arc<dyn WorkItemHandler> {
        match self {
            // The singleton is built from whichever queue asks first.
            Self::Singleton { factory, instance } => {
                Arc::clone(instance.get_or_init(|| factory.create(queue)))
            }
            Self::PerQueue { factory, cache } => {
                if let Some(handler) = cache.get(queue) {
                    return Arc::clone(handler.value());
                }
                Arc::clone(
                    cache
                        .entry(queue.to_string())
                        .or_insert_with(|| factory.create(queue))
                        .value(),
                )
            }
            Self::PerWorkItem { factory } => factory.create(queue),
        }
    }

    /// Drop the cached handler for `queue`; a no-op outside per-queue mode
    pub fn evict(&self, queue: &str) -> bool {
        match self {
            Self::PerQueue { cache, .. } => cache.remove(queue).is_some(),
            _ => false,
        }
    }

    /// Number of per-queue handlers currently cached
    pub fn cached_count(&self) -> usize {
        match self {
            Self::PerQueue { cache, .. } => cache.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_factory(created: Arc<AtomicUsize>) -> Arc<dyn HandlerFactory> {
        Arc::new(move |_queue: &str| {
            created.fetch_add(1, Ordering::SeqCst);
            handler_fn(|_item: WorkItem| async { Ok(None) })
        })
    }

    #[test]
    fn test_singleton_builds_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let resolver =
            HandlerResolver::new(HandlerMode::Singleton, counting_factory(created.clone()));

        let a = resolver.resolve("q1");
        let b = resolver.resolve("q2");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(!resolver.evict("q1"));
    }

    #[test]
    fn test_per_queue_caches_until_evicted() {
        let created = Arc::new(AtomicUsize::new(0));
        let resolver =
            HandlerResolver::new(HandlerMode::PerQueue, counting_factory(created.clone()));

        let a1 = resolver.resolve("q1");
        let a2 = resolver.resolve("q1");
        let b = resolver.resolve("q2");

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(resolver.cached_count(), 2);

        assert!(resolver.evict("q1"));
        assert!(!resolver.evict("q1"));
        let a3 = resolver.resolve("q1");
        assert!(!Arc::ptr_eq(&a1, &a3));
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_per_work_item_never_caches() {
        let created = Arc::new(AtomicUsize::new(0));
        let resolver =
            HandlerResolver::new(HandlerMode::PerWorkItem, counting_factory(created.clone()));

        resolver.resolve("q1");
        resolver.resolve("q1");

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_fn_emits_follow_up() {
        let handler = handler_fn(|item: WorkItem| async move {
            let n = item.payload["n"].as_u64().unwrap_or(0);
            Ok(Some(item.follow_up(json!({ "n": n + 1 }))))
        });

        let out = handler
            .handle(WorkItem::new("q1", json!({ "n": 1 })))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.payload["n"], 2);
        assert_eq!(out.queue, "q1");
    }

    #[test]
    fn test_handler_mode_parsing() {
        assert_eq!("per_queue".parse::<HandlerMode>(), Ok(HandlerMode::PerQueue));
        assert_eq!("Singleton".parse::<HandlerMode>(), Ok(HandlerMode::Singleton));
        assert_eq!("per-work-item".parse::<HandlerMode>(), Ok(HandlerMode::PerWorkItem));
        assert!("pooled".parse::<HandlerMode>().is_err());

        let mode: HandlerMode = serde_json::from_str("\"per_work_item\"").unwrap();
        assert_eq!(mode, HandlerMode::PerWorkItem);
    }
}
