use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

/// Receives inbound notifications for one method.
///
/// Any `Fn(Value) -> impl Future<Output = ()>` closure is a handler.
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn on_notification(&self, params: Value);
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_notification(&self, params: Value) {
        (self)(params).await
    }
}

/// Method name → handler map. The last registration for a name wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn NotificationHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn NotificationHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when an earlier handler was replaced
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn NotificationHandler>) -> bool {
        self.lock().insert(method.into(), handler).is_some()
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.lock().get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.lock().contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
