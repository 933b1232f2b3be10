//! Named event handlers.
//!
//! Entities and timers refer to handlers by name only. The gameplay layer
//! registers the actual functions once, before the world starts ticking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::metrics;

use super::serial::Serial;
use super::World;

/// `(world, receiver, source, payload) -> handled`.
pub type EventHandler = Arc<dyn Fn(&mut World, Serial, Serial, &str) -> bool + Send + Sync>;

#[derive(Default)]
pub struct EventRegistryBuilder {
    handlers: HashMap<String, EventHandler>,
}

impl EventRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. A second registration of the same
    /// name replaces the first.
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut World, Serial, Serial, &str) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!("event handler '{}' registered twice; keeping the last", name);
        }
        self
    }

    pub fn build(self) -> Arc<EventRegistry> {
        Arc::new(EventRegistry {
            handlers: self.handlers,
        })
    }
}

#[derive(Default)]
pub struct EventRegistry {
    handlers: HashMap<String, EventHandler>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl EventRegistry {
    pub fn empty() -> Arc<EventRegistry> {
        Arc::new(EventRegistry::default())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler registered under `name`. Unknown names are not handled.
    pub fn execute(
        &self,
        name: &str,
        world: &mut World,
        receiver: Serial,
        source: Serial,
        payload: &str,
    ) -> bool {
        match self.handlers.get(name) {
            Some(handler) => {
                metrics::record_event(name);
                handler(world, receiver, source, payload)
            }
            None => {
                warn!("no handler registered for event '{}'", name);
                false
            }
        }
    }
}
