//! Envelope: wraps/unwraps a payload with sender id, timestamp, nonce and a
//! mixer tag, enforcing freshness and replay rejection.
use std::collections::HashMap;

use thiserror::Error;

use crate::clock::Timestamp;
use crate::codec::{self, Value};
use crate::identity::{NodeId, Secret};
use crate::mixer;

/// Wire protocol version. Bumping this is how a future secure-MAC upgrade
/// would be introduced -- this implementation only understands 2.
pub const VERSION: u32 = 2;

/// Future skew we tolerate: a timestamp this far ahead of our clock is
/// rejected as `FromFuture`.
pub const MAX_FUTURE_SKEW_MS: i64 = 5_000;
/// Past age we tolerate: a timestamp older than this is rejected as `Expired`.
pub const MAX_PAST_AGE_MS: i64 = 60_000;
/// How long a nonce is remembered after receipt, for replay rejection.
pub const NONCE_RETENTION_MS: i64 = 120_000;

/// A versioned, authenticated wrapper around a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: u32,
    pub payload: Vec<u8>,
    pub sender_id: NodeId,
    pub timestamp: Timestamp,
    pub nonce: String,
    /// Set only for a recipient-bound (unicast) envelope.
    pub recipient_id: Option<NodeId>,
    pub tag: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("envelope version mismatch")]
    WrongVersion,
    #[error("unknown sender")]
    UnknownSender,
    #[error("envelope timestamp is too old")]
    Expired,
    #[error("envelope timestamp is from the future")]
    FromFuture,
    #[error("nonce already seen")]
    Replay,
    #[error("authentication tag does not match")]
    BadTag,
    #[error("envelope is structurally malformed: {0}")]
    Malformed(String),
}

impl From<codec::DecodeError> for Error {
    fn from(e: codec::DecodeError) -> Self {
        Error::Malformed(e.to_string())
    }
}

/// Per-node nonce cache, entered only from the envelope layer. Owned by the
/// scheduler and passed by reference -- never a process-global singleton.
#[derive(Debug, Default)]
pub struct NonceCache {
    seen: HashMap<String, Timestamp>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a nonce as seen, rejecting it if already present.
    fn record(&mut self, nonce: &str, now: Timestamp) -> bool {
        if self.seen.contains_key(nonce) {
            return false;
        }
        self.seen.insert(nonce.to_owned(), now);
        true
    }

    /// Evict nonces older than the retention window. Called on every
    /// unwrap, and may also be called from scheduler housekeeping.
    pub fn sweep(&mut self, now: Timestamp) {
        self.seen
            .retain(|_, &mut seen_at| now - seen_at <= NONCE_RETENTION_MS);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn generate_nonce(sender_id: &NodeId, now: Timestamp) -> String {
    let mut rng = fastrand::Rng::new();
    let rand: u64 = rng.u64(..);
    format!("{}_{}_{:x}", sender_id, now, rand)
}

fn tag_input(
    payload: &[u8],
    sender_id: &NodeId,
    timestamp: Timestamp,
    nonce: &str,
    recipient_id: Option<&NodeId>,
    secret: &Secret,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 64);
    buf.extend_from_slice(payload);
    // The recipient-bound formula excludes the sender id from the
    // tag input and adds the recipient id instead.
    if let Some(recipient) = recipient_id {
        buf.extend_from_slice(timestamp.to_string().as_bytes());
        buf.extend_from_slice(nonce.as_bytes());
        buf.extend_from_slice(recipient.to_string().as_bytes());
    } else {
        buf.extend_from_slice(sender_id.to_string().as_bytes());
        buf.extend_from_slice(timestamp.to_string().as_bytes());
        buf.extend_from_slice(nonce.as_bytes());
    }
    buf.extend_from_slice(secret.expose().as_bytes());
    buf
}

/// Wrap a payload for broadcast (or unaddressed unicast) delivery.
pub fn wrap(payload: &Value, sender_id: &NodeId, secret: &Secret, now: Timestamp) -> Envelope {
    wrap_inner(payload, sender_id, None, secret, now)
}

/// Wrap a payload addressed to a specific recipient. The tag covers the
/// recipient id instead of the sender id.
pub fn wrap_to(
    payload: &Value,
    sender_id: &NodeId,
    recipient_id: &NodeId,
    secret: &Secret,
    now: Timestamp,
) -> Envelope {
    wrap_inner(payload, sender_id, Some(recipient_id), secret, now)
}

fn wrap_inner(
    payload: &Value,
    sender_id: &NodeId,
    recipient_id: Option<&NodeId>,
    secret: &Secret,
    now: Timestamp,
) -> Envelope {
    let payload_bytes = codec::encode(payload);
    let nonce = generate_nonce(sender_id, now);
    let tag = mixer::strong_mix(&tag_input(
        &payload_bytes,
        sender_id,
        now,
        &nonce,
        recipient_id,
        secret,
    ));

    Envelope {
        version: VERSION,
        payload: payload_bytes,
        sender_id: sender_id.clone(),
        timestamp: now,
        nonce,
        recipient_id: recipient_id.cloned(),
        tag,
    }
}

/// Unwrap and verify an envelope, recording its nonce on success.
///
/// `lookup_secret` resolves the sender's shared secret; returning `None`
/// yields `UnknownSender`. Nonces are swept on every call.
pub fn unwrap(
    envelope: &Envelope,
    lookup_secret: impl FnOnce(&NodeId) -> Option<Secret>,
    nonces: &mut NonceCache,
    now: Timestamp,
) -> Result<(Value, NodeId), Error> {
    nonces.sweep(now);

    if envelope.version != VERSION {
        return Err(Error::WrongVersion);
    }
    if envelope.nonce.is_empty() || envelope.tag.is_empty() {
        return Err(Error::Malformed("missing nonce or tag".into()));
    }

    let secret = lookup_secret(&envelope.sender_id).ok_or(Error::UnknownSender)?;

    let expected_tag = mixer::strong_mix(&tag_input(
        &envelope.payload,
        &envelope.sender_id,
        envelope.timestamp,
        &envelope.nonce,
        envelope.recipient_id.as_ref(),
        &secret,
    ));
    if !constant_time_eq(expected_tag.as_bytes(), envelope.tag.as_bytes()) {
        return Err(Error::BadTag);
    }

    let age = now - envelope.timestamp;
    if age > MAX_PAST_AGE_MS {
        return Err(Error::Expired);
    }
    if age < -MAX_FUTURE_SKEW_MS {
        return Err(Error::FromFuture);
    }

    if !nonces.record(&envelope.nonce, now) {
        return Err(Error::Replay);
    }

    let payload = codec::decode(&envelope.payload)?;
    Ok((payload, envelope.sender_id.clone()))
}

/// Not actually constant-time (the mixer isn't a MAC) but
/// kept as a single comparison point so a future secure upgrade has one
/// place to harden.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a == b
}

/// The wire shape an envelope is encoded to/from. Shared by the scheduler
/// (general swarm traffic) and the runtime (pairing's recipient-bound
/// deliveries), so there is exactly one place that knows the field names.
pub fn to_wire_value(e: &Envelope) -> Value {
    let mut b = Value::map()
        .field("version", e.version as i64)
        .field("senderID", e.sender_id.to_string())
        .field("timestamp", e.timestamp)
        .field("nonce", e.nonce.as_str())
        .field("tag", e.tag.as_str())
        .field("payload", String::from_utf8_lossy(&e.payload).into_owned());
    if let Some(recipient) = &e.recipient_id {
        b = b.field("recipientID", recipient.to_string());
    }
    b.build()
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("envelope is structurally malformed")]
pub struct WireParseError;

pub fn from_wire_value(value: &Value) -> Result<Envelope, WireParseError> {
    let version = value.get("version").and_then(Value::as_int).ok_or(WireParseError)? as u32;
    let sender_id = value
        .get("senderID")
        .and_then(Value::as_str)
        .map(NodeId::new)
        .ok_or(WireParseError)?;
    let timestamp = value.get("timestamp").and_then(Value::as_int).ok_or(WireParseError)?;
    let nonce = value
        .get("nonce")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(WireParseError)?;
    let tag = value
        .get("tag")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(WireParseError)?;
    let payload = value
        .get("payload")
        .and_then(Value::as_str)
        .map(|s| s.as_bytes().to_vec())
        .ok_or(WireParseError)?;
    let recipient_id = value.get("recipientID").and_then(Value::as_str).map(NodeId::new);

    Ok(Envelope {
        version,
        payload,
        sender_id,
        timestamp,
        nonce,
        recipient_id,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Secret {
        Secret::from_raw("s".repeat(32))
    }

    fn sender() -> NodeId {
        NodeId::new("A")
    }

    #[test]
    fn round_trip() {
        let payload = Value::map().field("type", "PING").field("x", 1i64).build();
        let env = wrap(&payload, &sender(), &secret(), 1_000);

        assert_eq!(env.version, VERSION);
        assert_eq!(env.sender_id, sender());
        assert!(!env.nonce.is_empty());
        assert_eq!(env.tag.len(), 64);

        let mut nonces = NonceCache::new();
        let (decoded, from) = unwrap(&env, |_| Some(secret()), &mut nonces, 1_000).unwrap();

        assert_eq!(decoded, payload);
        assert_eq!(from, sender());
    }

    #[test]
    fn replay_is_rejected_on_second_unwrap() {
        let payload = Value::map().field("type", "PING").build();
        let env = wrap(&payload, &sender(), &secret(), 1_000);
        let mut nonces = NonceCache::new();

        unwrap(&env, |_| Some(secret()), &mut nonces, 1_000).unwrap();
        let err = unwrap(&env, |_| Some(secret()), &mut nonces, 1_000).unwrap_err();

        assert_eq!(err, Error::Replay);
    }

    #[test]
    fn tamper_in_any_field_is_rejected() {
        let payload = Value::map().field("type", "PING").build();
        let base = wrap(&payload, &sender(), &secret(), 1_000);

        let mut tampered_payload = base.clone();
        tampered_payload.payload[0] ^= 0xFF;
        assert!(unwrap(&tampered_payload, |_| Some(secret()), &mut NonceCache::new(), 1_000).is_err());

        let mut tampered_sender = base.clone();
        tampered_sender.sender_id = NodeId::new("B");
        assert!(matches!(
            unwrap(&tampered_sender, |_| Some(secret()), &mut NonceCache::new(), 1_000),
            Err(Error::BadTag)
        ));

        let mut tampered_ts = base.clone();
        tampered_ts.timestamp += 1;
        assert!(unwrap(&tampered_ts, |_| Some(secret()), &mut NonceCache::new(), 1_000).is_err());

        let mut tampered_nonce = base.clone();
        tampered_nonce.nonce.push('x');
        assert!(unwrap(&tampered_nonce, |_| Some(secret()), &mut NonceCache::new(), 1_000).is_err());

        let mut tampered_tag = base;
        tampered_tag.tag.replace_range(0..1, if &tampered_tag.tag[0..1] == "0" { "1" } else { "0" });
        assert!(matches!(
            unwrap(&tampered_tag, |_| Some(secret()), &mut NonceCache::new(), 1_000),
            Err(Error::BadTag)
        ));
    }

    #[test]
    fn freshness_bounds() {
        let payload = Value::map().field("type", "PING").build();

        let stale = wrap(&payload, &sender(), &secret(), 0);
        let err = unwrap(&stale, |_| Some(secret()), &mut NonceCache::new(), 61_000).unwrap_err();
        assert_eq!(err, Error::Expired);

        let from_future = wrap(&payload, &sender(), &secret(), 6_000);
        let err = unwrap(&from_future, |_| Some(secret()), &mut NonceCache::new(), 0).unwrap_err();
        assert_eq!(err, Error::FromFuture);
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let payload = Value::map().field("type", "PING").build();
        let env = wrap(&payload, &sender(), &secret(), 1_000);
        let err = unwrap(&env, |_| None, &mut NonceCache::new(), 1_000).unwrap_err();
        assert_eq!(err, Error::UnknownSender);
    }

    #[test]
    fn recipient_bound_envelope_verifies_with_its_own_formula() {
        let payload = Value::map().field("type", "PAIR_DELIVER").build();
        let env = wrap_to(&payload, &sender(), &NodeId::new("worker-1"), &secret(), 1_000);

        let (decoded, from) = unwrap(&env, |_| Some(secret()), &mut NonceCache::new(), 1_000).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(from, sender());
    }

    #[test]
    fn wire_value_round_trips() {
        let payload = Value::map().field("type", "PAIR_DELIVER").build();
        let env = wrap_to(&payload, &sender(), &NodeId::new("worker-1"), &secret(), 1_000);

        let value = to_wire_value(&env);
        let decoded = from_wire_value(&value).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn nonce_cache_sweeps_after_retention_window() {
        let mut nonces = NonceCache::new();
        nonces.record("n1", 0);
        assert_eq!(nonces.len(), 1);

        nonces.sweep(NONCE_RETENTION_MS + 1);
        assert!(nonces.is_empty());
    }
}
