//! Module registry: named vat setups that configuration files can refer to.

use std::collections::BTreeMap;

use capkernel_types::SharedVatSetup;

use crate::demo;
use crate::error::{ControllerError, ControllerResult};

#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, SharedVatSetup>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the demo modules (`demo-bootstrap`,
    /// `demo-counter`, `demo-echo`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("demo-bootstrap", demo::bootstrap_vat())
            .register("demo-counter", demo::counter_vat())
            .register("demo-echo", demo::echo_vat());
        registry
    }

    /// Add or replace a module.
    pub fn register(&mut self, name: impl Into<String>, setup: SharedVatSetup) -> &mut Self {
        self.modules.insert(name.into(), setup);
        self
    }

    pub fn get(&self, name: &str) -> ControllerResult<SharedVatSetup> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownModule(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ModuleRegistry::with_builtins();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["demo-bootstrap", "demo-counter", "demo-echo"]);
        assert!(registry.get("demo-echo").is_ok());
    }

    #[test]
    fn test_unknown_module() {
        let registry = ModuleRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(ControllerError::UnknownModule(name)) if name == "missing"
        ));
    }
}
