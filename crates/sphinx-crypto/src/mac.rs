use subtle::ConstantTimeEq;

use sphinx_core::MAC_SIZE;

/// Keyed hash binding a proof-of-work challenge to the request that asked
/// for it: `MAC(key, req ‖ challenge)`.
///
/// The server keeps no per-challenge state; this MAC is the only thing that
/// makes a returned challenge trustworthy.
pub fn challenge_mac(key: &[u8; 32], req: &[u8], challenge: &[u8]) -> [u8; MAC_SIZE] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(req);
    hasher.update(challenge);
    *hasher.finalize().as_bytes()
}

/// Constant-time comparison of a received MAC against the recomputed one.
pub fn mac_verify(expected: &[u8; MAC_SIZE], got: &[u8]) -> bool {
    got.len() == MAC_SIZE && bool::from(expected[..].ct_eq(got))
}
