use futures_util::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use crate::event_sourcing::core::{EventName, InvalidEventName, StoredEvent};

type AsyncHandler<T> =
    Arc<dyn Fn(Arc<T>, StoredEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerRegistrationError {
    #[error(transparent)]
    InvalidName(#[from] InvalidEventName),

    #[error("Handler registered twice for {0}")]
    Duplicate(String),
}

/// Static table from canonical event name to an async handler on `T`.
///
/// Built once at startup by the component that owns `T` (a read model,
/// an inbound notification handler); the handled topics follow from the
/// registered names.
pub struct EventHandlerTable<T> {
    handlers: HashMap<String, AsyncHandler<T>>,
}

impl<T: Send + Sync + 'static> EventHandlerTable<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `event_name` (canonical or dotted form). Each
    /// name takes one handler; both spellings count as the same name.
    pub fn on<F, Fut>(mut self, event_name: &str, handler: F) -> Result<Self, HandlerRegistrationError>
    where
        F: Fn(Arc<T>, StoredEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = EventName::parse(event_name)?.to_string();
        if self.handlers.contains_key(&name) {
            return Err(HandlerRegistrationError::Duplicate(name));
        }

        let boxed: AsyncHandler<T> = Arc::new(
            move |target: Arc<T>, event: StoredEvent| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(handler(target, event))
            },
        );
        self.handlers.insert(name, boxed);
        Ok(self)
    }

    pub fn topics(&self) -> BTreeSet<String> {
        self.handlers
            .keys()
            .filter_map(|name| EventName::parse(name).ok())
            .map(|name| name.topic())
            .collect()
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn handles(&self, name: &EventName) -> bool {
        self.handlers.contains_key(&name.to_string())
    }

    /// Run the handler for `event`; `None` when nothing is registered.
    pub async fn dispatch(&self, target: &Arc<T>, event: &StoredEvent) -> Option<anyhow::Result<()>> {
        let handler = self.handlers.get(&event.name.to_string())?.clone();
        Some(handler(target.clone(), event.clone()).await)
    }
}

impl<T: Send + Sync + 'static> Default for EventHandlerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
