//! Proxy Facade: a locally-callable stand-in for a peripheral that may live
//! on this node or a remote one, resolved fresh on every call under the
//! local-first rule.
use std::cell::Cell;

use crate::clock::Timestamp;
use crate::codec::Value;
use crate::discovery::{Discovery, Resolution};
use crate::identity::NodeId;
use crate::message::Payload;
use crate::peripheral::{HostPeripherals, InvokeError, PeripheralDirectory};
use crate::rpc::{CallResult, RpcClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    NotFound,
}

/// A handle callers hold onto by peripheral name; it never caches the
/// *resolution* (a peripheral moving from remote to local, or vanishing,
/// between calls is picked up automatically), but it does remember whether
/// the last thing it heard back was a timeout or an unreachable target, per
/// the facade's connection state machine.
#[derive(Debug)]
pub struct Proxy {
    name: String,
    connected: Cell<bool>,
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            connected: Cell::new(self.connected.get()),
        }
    }
}

impl Proxy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: Cell::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once a prior call has timed out or come back unreachable, even
    /// if the peripheral would otherwise still resolve; `reconnect` is what
    /// clears that back to true.
    pub fn is_connected(&self, discovery: &Discovery, local: &PeripheralDirectory) -> bool {
        self.connected.get() && !matches!(discovery.resolve(&self.name, local), Resolution::Unknown)
    }

    pub fn get_type(
        &self,
        discovery: &Discovery,
        local: &PeripheralDirectory,
    ) -> Option<String> {
        match discovery.resolve(&self.name, local) {
            Resolution::Local => local.get(&self.name).map(|d| d.type_name.clone()),
            Resolution::Remote(_) => discovery
                .remote_peripherals()
                .get(&self.name)
                .map(|r| r.type_name.clone()),
            Resolution::Unknown => None,
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_methods(&self, local: &PeripheralDirectory) -> Option<Vec<String>> {
        // Remote method sets are not carried by ANNOUNCE; only a locally
        // resolved peripheral has a known method set.
        local.get(&self.name).map(|d| d.methods.clone())
    }

    /// Force a fresh resolution on the next call by re-running discovery
    /// housekeeping and issuing a DISCOVER; clears the disconnected flag on
    /// success. Returns whether the peripheral is known at all right now.
    pub fn reconnect(&self, discovery: &mut Discovery, local: &PeripheralDirectory, now: Timestamp) -> bool {
        discovery.housekeeping(now);
        let found = !matches!(discovery.resolve(&self.name, local), Resolution::Unknown);
        self.connected.set(found);
        found
    }

    /// Record the outcome of a call dispatched earlier through `call`, once
    /// it resolves. A remote `CallDispatch` only yields a request id at
    /// dispatch time; the eventual `CallResult` -- in particular a timeout --
    /// is observed later by whoever owns the RPC pending-call table, and fed
    /// back here so `is_connected` reflects it.
    pub fn note_result(&self, result: &CallResult) {
        if matches!(result, CallResult::TimedOut) {
            self.connected.set(false);
        }
    }

    /// Invoke a method, serving it locally if the peripheral is attached
    /// here, or issuing an RPC CALL to its resolved origin otherwise.
    pub fn call(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
        discovery: &Discovery,
        local: &PeripheralDirectory,
        host: &dyn HostPeripherals,
        rpc: &mut RpcClient,
        now: Timestamp,
    ) -> Result<CallDispatch, ProxyError> {
        let method = method.into();
        match discovery.resolve(&self.name, local) {
            Resolution::Local => {
                let outcome = host.invoke(&self.name, &method, &args);
                Ok(CallDispatch::Local(outcome))
            }
            Resolution::Remote(origin) => {
                let (request_id, payload) =
                    rpc.call(origin, self.name.clone(), method, args, now);
                Ok(CallDispatch::Remote { request_id, payload })
            }
            Resolution::Unknown => {
                self.connected.set(false);
                Err(ProxyError::NotFound)
            }
        }
    }
}

/// What calling through a proxy actually did: a peripheral attached here is
/// invoked synchronously; a remote one produces a CALL payload the caller
/// must send and a request id to correlate the eventual RESULT against.
#[derive(Debug)]
pub enum CallDispatch {
    Local(Result<Vec<Value>, InvokeError>),
    Remote { request_id: String, payload: Payload },
}
