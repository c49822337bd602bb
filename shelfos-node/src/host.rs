//! Placeholder for the host runtime's peripheral primitive. Real embedded
//! deployments replace this with a host-specific `HostPeripherals`
//! implementation backed by the platform's actual drivers; this binary
//! ships a host with no peripherals attached so the fabric still starts and
//! serves discovery/enrollment on a node with nothing local to share.
use shelfos::codec::Value;
use shelfos::peripheral::{HostPeripherals, InvokeError};

pub struct NullHost;

impl HostPeripherals for NullHost {
    fn list_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_type(&self, _name: &str) -> Option<String> {
        None
    }

    fn get_methods(&self, _name: &str) -> Option<Vec<String>> {
        None
    }

    fn invoke(&self, name: &str, _method: &str, _args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        Err(InvokeError::NoSuchPeripheral(name.to_owned()))
    }
}
