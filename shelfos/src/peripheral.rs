//! Peripheral Directory: wraps the host runtime's peripheral primitive
//! (listing attached peripherals, their type and method set).
use thiserror::Error;

use crate::codec::Value;

/// A locally or remotely known peripheral's shape: its type and the sorted,
/// deduplicated method set a caller may invoke on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralDescriptor {
    pub name: String,
    pub type_name: String,
    pub methods: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("no such peripheral: {0}")]
    NoSuchPeripheral(String),
    #[error("no such method `{1}` on peripheral `{0}`")]
    NoSuchMethod(String, String),
    #[error("peripheral execution failed: {0}")]
    ExecutionFailed(String),
}

/// The seam the out-of-scope host runtime plugs into: "list names, list
/// methods, invoke method by name with argument list".
pub trait HostPeripherals {
    fn list_names(&self) -> Vec<String>;
    fn get_type(&self, name: &str) -> Option<String>;
    fn get_methods(&self, name: &str) -> Option<Vec<String>>;
    fn invoke(&self, name: &str, method: &str, args: &[Value]) -> Result<Vec<Value>, InvokeError>;
}

/// A snapshot-in-time view of the local peripherals, re-taken on startup or
/// on an explicit rescan.
#[derive(Debug, Clone, Default)]
pub struct PeripheralDirectory {
    descriptors: Vec<PeripheralDescriptor>,
}

impl PeripheralDirectory {
    pub fn rescan(host: &dyn HostPeripherals) -> Self {
        let mut descriptors = Vec::new();
        for name in host.list_names() {
            let Some(type_name) = host.get_type(&name) else {
                continue;
            };
            let mut methods = host.get_methods(&name).unwrap_or_default();
            methods.sort();
            methods.dedup();
            descriptors.push(PeripheralDescriptor {
                name,
                type_name,
                methods,
            });
        }
        Self { descriptors }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&PeripheralDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn descriptors(&self) -> &[PeripheralDescriptor] {
        &self.descriptors
    }
}

/// An in-memory host used by tests and as a reference implementation for a
/// real embedded host to imitate.
#[derive(Debug, Default)]
pub struct MockHost {
    peripherals: Vec<(String, String, Vec<String>)>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        methods: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        self.peripherals.push((
            name.into(),
            type_name.into(),
            methods.into_iter().map(str::to_owned).collect(),
        ));
        self
    }

    fn find(&self, name: &str) -> Option<&(String, String, Vec<String>)> {
        self.peripherals.iter().find(|(n, ..)| n == name)
    }
}

impl HostPeripherals for MockHost {
    fn list_names(&self) -> Vec<String> {
        self.peripherals.iter().map(|(n, ..)| n.clone()).collect()
    }

    fn get_type(&self, name: &str) -> Option<String> {
        self.find(name).map(|(_, t, _)| t.clone())
    }

    fn get_methods(&self, name: &str) -> Option<Vec<String>> {
        self.find(name).map(|(_, _, m)| m.clone())
    }

    fn invoke(&self, name: &str, method: &str, _args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        let (_, _, methods) = self
            .find(name)
            .ok_or_else(|| InvokeError::NoSuchPeripheral(name.to_owned()))?;
        if !methods.iter().any(|m| m == method) {
            return Err(InvokeError::NoSuchMethod(name.to_owned(), method.to_owned()));
        }
        Ok(vec![Value::Int(500_000)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescan_sorts_and_dedupes_methods() {
        let host = MockHost::new().attach(
            "me_bridge_0",
            "battery",
            ["getStoredEnergy", "getStoredEnergy", "charge"],
        );
        let dir = PeripheralDirectory::rescan(&host);
        let descriptor = dir.get("me_bridge_0").unwrap();

        assert_eq!(descriptor.methods, vec!["charge", "getStoredEnergy"]);
    }

    #[test]
    fn unknown_peripheral_is_absent() {
        let dir = PeripheralDirectory::rescan(&MockHost::new());
        assert!(dir.get("nope").is_none());
    }
}
