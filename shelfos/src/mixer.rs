//! Keyed, non-cryptographic mixing function used to sign and verify
//! envelopes. This is not a MAC: it is a fixed wire contract every peer must
//! reproduce bit-identically, not a defense against a determined adversary.
//! Do not substitute a secure MAC here without bumping the envelope version.

/// One fold of the input through two djb2-style accumulators, the second
/// doubling each byte before mixing it in.
fn fold(input: &[u8]) -> (u32, u32) {
    let mut h1: u32 = 5381;
    let mut h2: u32 = 52711;

    for &b in input {
        h1 = h1.wrapping_mul(33).wrapping_add(b as u32);
        h2 = h2.wrapping_mul(33).wrapping_add((b as u32).wrapping_mul(2));
    }
    (h1, h2)
}

fn hex_pair(h1: u32, h2: u32) -> String {
    format!("{h1:08x}{h2:08x}")
}

/// A single mixing pass, producing a 16 hex-character digest.
pub fn mix(input: &[u8]) -> String {
    let (h1, h2) = fold(input);
    hex_pair(h1, h2)
}

/// Four chained mixing passes over increasingly entangled views of the
/// input, concatenated into the 64 hex-character envelope tag.
pub fn strong_mix(input: &[u8]) -> String {
    let (h1, h2a) = fold(input);
    let pass1 = hex_pair(h1, h2a);

    let mut buf = Vec::with_capacity(input.len() + 4);
    buf.extend_from_slice(input);
    buf.extend_from_slice(&h1.to_be_bytes());
    let (h2, h2b) = fold(&buf);
    let pass2 = hex_pair(h2, h2b);

    buf.clear();
    buf.extend_from_slice(&h1.to_be_bytes());
    buf.extend_from_slice(input);
    buf.extend_from_slice(&h2.to_be_bytes());
    let (h3, h3b) = fold(&buf);
    let pass3 = hex_pair(h3, h3b);

    buf.clear();
    buf.extend_from_slice(&h2.to_be_bytes());
    buf.extend_from_slice(&h3.to_be_bytes());
    buf.extend_from_slice(input);
    let (h4, h4b) = fold(&buf);
    let pass4 = hex_pair(h4, h4b);

    format!("{pass1}{pass2}{pass3}{pass4}")
}
