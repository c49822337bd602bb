//! Peripheral RPC: CALL/RESULT correlation. `RpcHost` serves calls against
//! locally attached peripherals; `RpcClient` tracks outstanding calls made
//! to remote peripherals by request id, with a timeout.
use std::collections::HashMap;

use crate::clock::Timestamp;
use crate::identity::NodeId;
use crate::message::{CallOutcome, Payload};
use crate::peripheral::HostPeripherals;

/// Default time a caller waits for a RESULT before giving up.
pub const CALL_TIMEOUT_MS: Timestamp = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Ok(Vec<crate::codec::Value>),
    Err(String),
    TimedOut,
}

#[derive(Debug, Clone)]
struct PendingCall {
    recipient: NodeId,
    peripheral_name: String,
    method: String,
    deadline: Timestamp,
}

/// The Pending Call Table of an RPC caller: one entry per
/// request id awaiting a RESULT.
#[derive(Debug, Default)]
pub struct RpcClient {
    pending: HashMap<String, PendingCall>,
    timeout: Timestamp,
}

impl RpcClient {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            timeout: CALL_TIMEOUT_MS,
        }
    }

    pub fn with_timeout(timeout: Timestamp) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Begin a call: allocates a fresh request id, registers the pending
    /// entry, and returns the CALL payload to send to `recipient`.
    pub fn call(
        &mut self,
        recipient: NodeId,
        peripheral_name: impl Into<String>,
        method: impl Into<String>,
        args: Vec<crate::codec::Value>,
        now: Timestamp,
    ) -> (String, Payload) {
        let request_id = format!("{}_{:x}", now, fastrand::u64(..));
        let peripheral_name = peripheral_name.into();
        let method = method.into();

        self.pending.insert(
            request_id.clone(),
            PendingCall {
                recipient,
                peripheral_name: peripheral_name.clone(),
                method: method.clone(),
                deadline: now + self.timeout,
            },
        );

        let payload = Payload::Call {
            request_id: request_id.clone(),
            peripheral_name,
            method,
            args,
        };
        (request_id, payload)
    }

    /// Resolve a RESULT payload against the pending call table. Returns
    /// `None` if the request id is unknown (stale, already timed out, or
    /// forged).
    pub fn on_result(&mut self, request_id: &str, outcome: CallOutcome) -> Option<CallResult> {
        self.pending.remove(request_id)?;
        Some(match outcome {
            CallOutcome::Ok(values) => CallResult::Ok(values),
            CallOutcome::Err(text) => CallResult::Err(text),
        })
    }

    /// Evict pending calls past their deadline, returning their request
    /// ids as timeouts. Intended to run on every housekeeping tick.
    pub fn housekeeping(&mut self, now: Timestamp) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.pending.remove(id);
        }
        expired
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn recipient_of(&self, request_id: &str) -> Option<&NodeId> {
        self.pending.get(request_id).map(|p| &p.recipient)
    }
}

/// Serves an incoming CALL against the local peripheral directory,
/// producing the RESULT payload to send back to the caller.
pub fn serve(host: &dyn HostPeripherals, call: &Payload) -> Payload {
    let Payload::Call {
        request_id,
        peripheral_name,
        method,
        args,
    } = call
    else {
        panic!("serve() called with a non-CALL payload");
    };

    let outcome = match host.invoke(peripheral_name, method, args) {
        Ok(values) => CallOutcome::Ok(values),
        Err(e) => CallOutcome::Err(e.to_string()),
    };

    Payload::Result {
        request_id: request_id.clone(),
        outcome,
    }
}
