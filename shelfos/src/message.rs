//! Payload kinds carried inside an [`crate::envelope::Envelope`], discriminated
//! by a `type` field.
use thiserror::Error;

use crate::codec::{self, Value};
use crate::identity::{NodeId, Secret};
use crate::queen::Credentials;

#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralSummary {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Ok(Vec<Value>),
    Err(String),
}

/// Every message kind the fabric sends over the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PairReady {
        node_id: NodeId,
        label: String,
        code: String,
    },
    PairDeliver {
        credentials: Credentials,
    },
    PairComplete {
        node_id: NodeId,
        label: String,
    },
    Announce {
        node_id: NodeId,
        label: String,
        peripherals: Vec<PeripheralSummary>,
    },
    Discover,
    Call {
        request_id: String,
        peripheral_name: String,
        method: String,
        args: Vec<Value>,
    },
    Result {
        request_id: String,
        outcome: CallOutcome,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed {0} payload")]
pub struct MalformedPayload(pub &'static str);

impl Payload {
    pub fn to_value(&self) -> Value {
        match self {
            Payload::PairReady { node_id, label, code } => Value::map()
                .field("type", "PAIR_READY")
                .field("nodeID", node_id.to_string())
                .field("label", label.as_str())
                .field("code", code.as_str())
                .build(),
            Payload::PairDeliver { credentials } => Value::map()
                .field("type", "PAIR_DELIVER")
                .field(
                    "credentials",
                    Value::map()
                        .field("swarmID", credentials.swarm_id.as_str())
                        .field("swarmSecret", credentials.swarm_secret.expose())
                        .field("peerID", credentials.peer_id.to_string())
                        .field("peerSecret", credentials.peer_secret.expose())
                        .field("swarmFingerprint", credentials.swarm_fingerprint.as_str())
                        .build(),
                )
                .build(),
            Payload::PairComplete { node_id, label } => Value::map()
                .field("type", "PAIR_COMPLETE")
                .field("nodeID", node_id.to_string())
                .field("label", label.as_str())
                .build(),
            Payload::Announce {
                node_id,
                label,
                peripherals,
            } => Value::map()
                .field("type", "ANNOUNCE")
                .field("nodeID", node_id.to_string())
                .field("label", label.as_str())
                .field(
                    "peripherals",
                    Value::List(
                        peripherals
                            .iter()
                            .map(|p| {
                                Value::map()
                                    .field("name", p.name.as_str())
                                    .field("type", p.type_name.as_str())
                                    .build()
                            })
                            .collect(),
                    ),
                )
                .build(),
            Payload::Discover => Value::map().field("type", "DISCOVER").build(),
            Payload::Call {
                request_id,
                peripheral_name,
                method,
                args,
            } => Value::map()
                .field("type", "CALL")
                .field("requestID", request_id.as_str())
                .field("peripheralName", peripheral_name.as_str())
                .field("method", method.as_str())
                .field("args", Value::List(args.clone()))
                .build(),
            Payload::Result { request_id, outcome } => {
                let mut builder = Value::map()
                    .field("type", "RESULT")
                    .field("requestID", request_id.as_str());
                builder = match outcome {
                    CallOutcome::Ok(values) => builder
                        .field("ok", true)
                        .field("values", Value::List(values.clone())),
                    CallOutcome::Err(text) => {
                        builder.field("ok", false).field("errorText", text.as_str())
                    }
                };
                builder.build()
            }
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedPayload> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MalformedPayload("missing type"))?;

        Ok(match kind {
            "PAIR_READY" => Payload::PairReady {
                node_id: field_node_id(value, "nodeID")?,
                label: field_str(value, "label")?,
                code: field_str(value, "code")?,
            },
            "PAIR_DELIVER" => {
                let creds = value
                    .get("credentials")
                    .ok_or(MalformedPayload("PAIR_DELIVER"))?;
                Payload::PairDeliver {
                    credentials: Credentials {
                        swarm_id: field_str(creds, "swarmID")?,
                        swarm_secret: Secret::from_raw(field_str(creds, "swarmSecret")?),
                        peer_id: field_node_id(creds, "peerID")?,
                        peer_secret: Secret::from_raw(field_str(creds, "peerSecret")?),
                        swarm_fingerprint: field_str(creds, "swarmFingerprint")?,
                    },
                }
            }
            "PAIR_COMPLETE" => Payload::PairComplete {
                node_id: field_node_id(value, "nodeID")?,
                label: field_str(value, "label")?,
            },
            "ANNOUNCE" => {
                let peripherals = value
                    .get("peripherals")
                    .and_then(Value::as_list)
                    .ok_or(MalformedPayload("ANNOUNCE"))?
                    .iter()
                    .map(|p| {
                        Ok(PeripheralSummary {
                            name: field_str(p, "name")?,
                            type_name: field_str(p, "type")?,
                        })
                    })
                    .collect::<Result<Vec<_>, MalformedPayload>>()?;
                Payload::Announce {
                    node_id: field_node_id(value, "nodeID")?,
                    label: field_str(value, "label")?,
                    peripherals,
                }
            }
            "DISCOVER" => Payload::Discover,
            "CALL" => Payload::Call {
                request_id: field_str(value, "requestID")?,
                peripheral_name: field_str(value, "peripheralName")?,
                method: field_str(value, "method")?,
                args: value
                    .get("args")
                    .and_then(Value::as_list)
                    .ok_or(MalformedPayload("CALL"))?
                    .to_vec(),
            },
            "RESULT" => {
                let ok = value
                    .get("ok")
                    .and_then(Value::as_bool)
                    .ok_or(MalformedPayload("RESULT"))?;
                let outcome = if ok {
                    let values = value
                        .get("values")
                        .and_then(Value::as_list)
                        .ok_or(MalformedPayload("RESULT"))?
                        .to_vec();
                    CallOutcome::Ok(values)
                } else {
                    CallOutcome::Err(field_str(value, "errorText")?)
                };
                Payload::Result {
                    request_id: field_str(value, "requestID")?,
                    outcome,
                }
            }
            _ => return Err(MalformedPayload("unknown payload type")),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        codec::encode(&self.to_value())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value = codec::decode(bytes)?;
        Ok(Self::from_value(&value)?)
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Codec(#[from] codec::DecodeError),
    #[error(transparent)]
    Malformed(#[from] MalformedPayload),
}

fn field_str(value: &Value, key: &'static str) -> Result<String, MalformedPayload> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(MalformedPayload(key))
}

fn field_node_id(value: &Value, key: &'static str) -> Result<NodeId, MalformedPayload> {
    field_str(value, key).map(NodeId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_ready_round_trips() {
        let msg = Payload::PairReady {
            node_id: NodeId::new("worker-1"),
            label: "kitchen-pi".into(),
            code: "ABCD-EFGH".into(),
        };
        let bytes = msg.encode();
        assert_eq!(Payload::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn call_and_result_round_trip() {
        let call = Payload::Call {
            request_id: "r1".into(),
            peripheral_name: "me_bridge_0".into(),
            method: "getStoredEnergy".into(),
            args: vec![],
        };
        assert_eq!(Payload::decode(&call.encode()).unwrap(), call);

        let result = Payload::Result {
            request_id: "r1".into(),
            outcome: CallOutcome::Ok(vec![Value::Int(500_000)]),
        };
        assert_eq!(Payload::decode(&result.encode()).unwrap(), result);

        let error_result = Payload::Result {
            request_id: "r1".into(),
            outcome: CallOutcome::Err("NoSuchMethod".into()),
        };
        assert_eq!(Payload::decode(&error_result.encode()).unwrap(), error_result);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let value = Value::map().field("type", "BOGUS").build();
        assert!(Payload::from_value(&value).is_err());
    }

    #[test]
    fn missing_type_is_rejected() {
        let value = Value::map().field("nodeID", "x").build();
        assert!(Payload::from_value(&value).is_err());
    }
}
