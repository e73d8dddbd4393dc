//! Subscriber interface and the handler wrappers the bus stores

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::events::Event;

pub type HandlerResult = anyhow::Result<()>;

/// A subscriber callback for one or more event types.
///
/// Errors and panics are trapped by the bus and never reach the publisher.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &mut Event) -> HandlerResult;

    /// Identity used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// `false` once the handler's owner is gone; the bus prunes it.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Identity of a subscription, stable across duplicate subscribe calls.
///
/// Method subscriptions include the subscription name: identical-code
/// folding may give two methods the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    target: usize,
    method: usize,
    name: u64,
}

impl HandlerId {
    pub(crate) fn of_arc(handler: &Arc<dyn EventHandler>) -> Self {
        Self {
            target: Arc::as_ptr(handler) as *const () as usize,
            method: 0,
            name: 0,
        }
    }

    pub(crate) fn of_method<T>(target: &Weak<T>, method: usize, name: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self {
            target: Weak::as_ptr(target) as *const () as usize,
            method,
            name: hasher.finish(),
        }
    }
}

/// Closure-backed handler
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&mut Event) -> HandlerResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&mut Event) -> HandlerResult + Send + Sync,
{
    fn handle(&self, event: &mut Event) -> HandlerResult {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&mut Event) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(FnHandler::new(name, f))
}

/// Bound method on a component, holding the component weakly so the bus
/// never keeps it alive.
pub struct MethodHandler<T> {
    name: String,
    target: Weak<T>,
    method: fn(&T, &mut Event) -> HandlerResult,
}

impl<T: Send + Sync> MethodHandler<T> {
    pub fn new(
        name: impl Into<String>,
        target: &Arc<T>,
        method: fn(&T, &mut Event) -> HandlerResult,
    ) -> Self {
        Self {
            name: name.into(),
            target: Arc::downgrade(target),
            method,
        }
    }

    pub fn id(&self) -> HandlerId {
        HandlerId::of_method(&self.target, self.method as usize, &self.name)
    }
}

impl<T: Send + Sync> EventHandler for MethodHandler<T> {
    fn handle(&self, event: &mut Event) -> HandlerResult {
        match self.target.upgrade() {
            Some(target) => (self.method)(&target, event),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}

/// How a subscription holds its handler
#[derive(Clone)]
pub(crate) enum HandlerRef {
    Strong(Arc<dyn EventHandler>),
    Weak(Weak<dyn EventHandler>),
}

impl HandlerRef {
    /// Live handler, or `None` if it should be pruned.
    pub(crate) fn upgrade(&self) -> Option<Arc<dyn EventHandler>> {
        let handler = match self {
            HandlerRef::Strong(h) => Arc::clone(h),
            HandlerRef::Weak(w) => w.upgrade()?,
        };
        handler.is_alive().then_some(handler)
    }
}
