//! The immutable set of registered handlers.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cause::{Cause, Reason};
use crate::error::RegistryError;
use crate::handler::HandlerDescriptor;
use crate::resource::{Body, EntityIdentity};

/// Collects handlers before the reactor starts.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: Vec<HandlerDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Declaration order is preserved for lifecycles.
    pub fn with_handler(mut self, handler: HandlerDescriptor) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut seen = HashSet::new();
        for handler in &self.handlers {
            if handler.reasons.is_empty() {
                return Err(RegistryError::NoReasons(handler.id.to_string()));
            }
            if !seen.insert(handler.id.clone()) {
                return Err(RegistryError::DuplicateHandler(handler.id.to_string()));
            }
        }
        Ok(Registry {
            handlers: self.handlers.into_iter().map(Arc::new).collect(),
        })
    }
}

/// Registered handlers, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    handlers: Vec<Arc<HandlerDescriptor>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn handlers(&self) -> &[Arc<HandlerDescriptor>] {
        &self.handlers
    }

    /// Event-watching handlers matching a raw-notification cause.
    pub fn watching_handlers(&self, cause: &Cause) -> Vec<Arc<HandlerDescriptor>> {
        self.handlers
            .iter()
            .filter(|h| h.is_watching() && h.matches(cause))
            .cloned()
            .collect()
    }

    /// Change-detecting handlers matching `cause`.
    pub fn changing_handlers(&self, cause: &Cause) -> Vec<Arc<HandlerDescriptor>> {
        if !cause.reason.is_actionable() || cause.reason == Reason::Event {
            return Vec::new();
        }
        self.handlers
            .iter()
            .filter(|h| h.matches(cause))
            .cloned()
            .collect()
    }

    /// Whether any change-detecting handler could apply to this entity.
    pub fn has_changing_handlers(&self, identity: &EntityIdentity, body: &Body) -> bool {
        self.handlers
            .iter()
            .any(|h| h.is_changing() && h.selector.matches(identity, body))
    }

    pub fn has_watching_handlers(&self, identity: &EntityIdentity, body: &Body) -> bool {
        self.handlers
            .iter()
            .any(|h| h.is_watching() && h.selector.matches(identity, body))
    }

    /// Whether deletion of this entity must wait for handlers.
    pub fn requires_finalizer(&self, identity: &EntityIdentity, body: &Body) -> bool {
        self.handlers.iter().any(|h| {
            h.requires_finalizer
                && h.reasons.contains(&Reason::Delete)
                && h.selector.matches(identity, body)
        })
    }
}
