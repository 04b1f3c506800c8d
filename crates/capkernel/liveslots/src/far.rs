use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::context::VatContext;
use crate::value::Value;

/// A method handler. `Err` rejects the caller's result promise.
pub type Method = Rc<dyn Fn(&mut VatContext<'_>, Vec<Value>) -> Result<Value, Value>>;

/// A remotely invocable object: an interface name and its methods, looked
/// up by name on every delivery.
#[derive(Clone)]
pub struct Far {
    interface: String,
    methods: BTreeMap<String, Method>,
}

impl Far {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut VatContext<'_>, Vec<Value>) -> Result<Value, Value> + 'static,
    {
        self.methods.insert(name.into(), Rc::new(handler));
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Method> {
        self.methods.get(name).cloned()
    }
}

impl fmt::Debug for Far {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Far")
            .field("interface", &self.interface)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}
