//! Crypto wrapper interfaces.
//!
//! Important: this crate intentionally does NOT implement novel cryptography.
//! It defines stable interfaces/types used by higher layers.
//!
//! The zk system is external. The bindings below stand in for real proofs:
//! they tie a proof to the public inputs it claims to cover, which is enough
//! for the node to exercise its verification path end to end.

use crate::constants::*;
use crate::serialization::hash32;
use crate::types::{Commitment, Hash32, Nullifier, Root};

/// A domain-separated PRF for nullifier derivation (placeholder wiring).
///
/// v0 default: `nf = BLAKE3(DS_NULLIFIER || sk_bytes || rho_bytes)`
pub fn derive_nullifier(sk_bytes: &[u8], rho_bytes: &[u8]) -> Nullifier {
    let mut input = Vec::with_capacity(sk_bytes.len() + rho_bytes.len());
    input.extend_from_slice(sk_bytes);
    input.extend_from_slice(rho_bytes);

    let h = hash32(DS_NULLIFIER, &input);
    let mut out = [0u8; NULLIFIER_LEN];
    out.copy_from_slice(h.as_bytes());
    Nullifier(out)
}

/// A domain-separated commitment helper (placeholder wiring).
///
/// v0 default: `cm = BLAKE3(DS_COMMITMENT || payload)`
pub fn commit_bytes(payload: &[u8]) -> Commitment {
    let h: Hash32 = hash32(DS_COMMITMENT, payload);
    let mut out = [0u8; COMMITMENT_LEN];
    out.copy_from_slice(h.as_bytes());
    Commitment(out)
}

/// Placeholder spend proof: `BLAKE3(DS_SPEND_PROOF || nullifier || anchor)`.
pub fn spend_binding(nullifier: &Nullifier, anchor: &Root) -> Vec<u8> {
    let mut input = [0u8; 64];
    input[..32].copy_from_slice(nullifier.as_bytes());
    input[32..].copy_from_slice(anchor.as_bytes());
    hash32(DS_SPEND_PROOF, &input).as_bytes().to_vec()
}

/// Placeholder output proof: `BLAKE3(DS_OUTPUT_PROOF || commitment)`.
pub fn output_binding(commitment: &Commitment) -> Vec<u8> {
    hash32(DS_OUTPUT_PROOF, commitment.as_bytes())
        .as_bytes()
        .to_vec()
}
