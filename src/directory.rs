//! Entity and resource directory.
//!
//! The marshalling layer never owns game objects. It asks a [`Directory`]
//! whether an entity is alive, what a resource is called, and which runtimes
//! a resource has loaded. [`Registry`] is a self-contained implementation
//! for hosts that do not bring their own world model.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::debug;

use crate::foreign::Sandbox;
use crate::interp::Interpreter;
use crate::value::{EntityId, ResourceId};

pub trait Directory {
    fn entity_exists(&self, id: EntityId) -> bool;

    fn resource_name(&self, id: ResourceId) -> Option<String>;

    fn resource_by_name(&self, name: &str) -> Option<ResourceId>;

    /// Whether the resource is running. Stopped resources keep their name
    /// but refuse calls.
    fn resource_active(&self, id: ResourceId) -> bool;

    fn interpreter(&self, id: ResourceId) -> Option<Rc<Interpreter>>;

    fn sandbox(&self, id: ResourceId) -> Option<Rc<Sandbox>>;
}

struct ResourceEntry {
    name: String,
    active: bool,
    interpreter: Option<Rc<Interpreter>>,
    sandbox: Option<Rc<Sandbox>>,
}

/// In-process directory with interior mutability.
///
/// Runtimes hold a weak handle back to the directory, so keep the registry
/// in an `Rc` for as long as they run.
pub struct Registry {
    resources: RefCell<HashMap<ResourceId, ResourceEntry>>,
    entities: RefCell<HashSet<EntityId>>,
    next_resource: Cell<u32>,
    next_entity: Cell<u32>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            resources: RefCell::new(HashMap::new()),
            entities: RefCell::new(HashSet::new()),
            next_resource: Cell::new(1),
            next_entity: Cell::new(1),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running resource. Names are unique; registering a taken
    /// name returns the existing id.
    pub fn add_resource(&self, name: &str) -> ResourceId {
        if let Some(id) = self.resource_by_name(name) {
            return id;
        }
        let id = ResourceId(self.next_resource.get());
        self.next_resource.set(id.0 + 1);
        self.resources.borrow_mut().insert(
            id,
            ResourceEntry {
                name: name.to_string(),
                active: true,
                interpreter: None,
                sandbox: None,
            },
        );
        debug!(%id, name, "resource registered");
        id
    }

    /// Mark a resource stopped and drop its runtimes.
    pub fn stop_resource(&self, id: ResourceId) {
        // Runtimes are dropped outside the borrow; their teardown may call back.
        let mut released = None;
        if let Some(entry) = self.resources.borrow_mut().get_mut(&id) {
            entry.active = false;
            released = Some((entry.interpreter.take(), entry.sandbox.take()));
        }
        drop(released);
        debug!(%id, "resource stopped");
    }

    pub fn attach_interpreter(&self, id: ResourceId, interpreter: Rc<Interpreter>) -> bool {
        match self.resources.borrow_mut().get_mut(&id) {
            Some(entry) => {
                entry.interpreter = Some(interpreter);
                true
            }
            None => false,
        }
    }

    pub fn attach_sandbox(&self, id: ResourceId, sandbox: Rc<Sandbox>) -> bool {
        match self.resources.borrow_mut().get_mut(&id) {
            Some(entry) => {
                entry.sandbox = Some(sandbox);
                true
            }
            None => false,
        }
    }

    pub fn spawn_entity(&self) -> EntityId {
        let id = EntityId(self.next_entity.get());
        self.next_entity.set(id.0 + 1);
        self.entities.borrow_mut().insert(id);
        id
    }

    pub fn destroy_entity(&self, id: EntityId) -> bool {
        self.entities.borrow_mut().remove(&id)
    }
}

impl Directory for Registry {
    fn entity_exists(&self, id: EntityId) -> bool {
        self.entities.borrow().contains(&id)
    }

    fn resource_name(&self, id: ResourceId) -> Option<String> {
        self.resources.borrow().get(&id).map(|entry| entry.name.clone())
    }

    fn resource_by_name(&self, name: &str) -> Option<ResourceId> {
        self.resources
            .borrow()
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(id, _)| *id)
    }

    fn resource_active(&self, id: ResourceId) -> bool {
        self.resources
            .borrow()
            .get(&id)
            .is_some_and(|entry| entry.active)
    }

    fn interpreter(&self, id: ResourceId) -> Option<Rc<Interpreter>> {
        self.resources
            .borrow()
            .get(&id)
            .and_then(|entry| entry.interpreter.clone())
    }

    fn sandbox(&self, id: ResourceId) -> Option<Rc<Sandbox>> {
        self.resources
            .borrow()
            .get(&id)
            .and_then(|entry| entry.sandbox.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_resolve_both_ways() {
        let registry = Registry::new();
        let id = registry.add_resource("freeroam");
        assert_eq!(registry.resource_by_name("freeroam"), Some(id));
        assert_eq!(registry.resource_name(id).as_deref(), Some("freeroam"));
        assert_eq!(registry.add_resource("freeroam"), id);
    }

    #[test]
    fn stopped_resource_keeps_name() {
        let registry = Registry::new();
        let id = registry.add_resource("race");
        registry.stop_resource(id);
        assert!(!registry.resource_active(id));
        assert!(registry.resource_name(id).is_some());
    }

    #[test]
    fn entities_live_until_destroyed() {
        let registry = Registry::new();
        let car = registry.spawn_entity();
        assert!(registry.entity_exists(car));
        assert!(registry.destroy_entity(car));
        assert!(!registry.entity_exists(car));
    }
}
