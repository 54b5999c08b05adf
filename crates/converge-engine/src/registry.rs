//! Operation registry
//!
//! Maps the operation names used by field selectors to constructors for the
//! operation that resolves them. Populated once when a resource type is
//! defined and validated against its schema.

use std::collections::BTreeMap;
use std::sync::Arc;

use converge_core::{Error, Result};

use crate::operation::{ApiOperation, UpdateOperation};

/// Constructor for an operation instance
pub type OperationFactory = Arc<dyn Fn() -> Box<dyn ApiOperation> + Send + Sync>;

#[derive(Clone, Default)]
pub struct OperationRegistry {
    factories: BTreeMap<String, OperationFactory>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom operation under `name`
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn ApiOperation> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Register the generic field-subset update under `name`
    pub fn register_update(&mut self, name: &str) {
        let op_name = name.to_string();
        self.register(name, move || Box::new(UpdateOperation::new(op_name.clone())));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate the operation registered under `name`.
    ///
    /// Resource types reject selectors naming unregistered operations when
    /// they are built, so a miss here is a programming error.
    pub fn build(&self, name: &str) -> Result<Box<dyn ApiOperation>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::invalid_input(format!("no operation registered for {:?}", name)))
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}
