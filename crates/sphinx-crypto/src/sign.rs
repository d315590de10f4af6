use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use sphinx_core::{OracleError, SIG_SIZE};

/// Verify a message carrying a trailing detached Ed25519 signature.
///
/// `msg` is `body ‖ sig[64]`; on success the body slice is returned. Any
/// failure (short input, malformed key, bad signature) is reported as
/// `BadSignature` so callers treat all of them as connection-fatal.
pub fn verify_blob<'a>(msg: &'a [u8], pk: &[u8; 32]) -> Result<&'a [u8], OracleError> {
    if msg.len() < SIG_SIZE {
        return Err(OracleError::BadSignature);
    }
    let (body, sig_bytes) = msg.split_at(msg.len() - SIG_SIZE);
    let vk = VerifyingKey::from_bytes(pk).map_err(|_| OracleError::BadSignature)?;
    let sig_arr: [u8; 64] = sig_bytes.try_into().expect("split_at leaves 64 bytes");
    let sig = Signature::from_bytes(&sig_arr);
    vk.verify(body, &sig).map_err(|_| OracleError::BadSignature)?;
    Ok(body)
}

/// Verify a detached signature over `msg` (used for the auth nonce).
pub fn verify_detached(msg: &[u8], sig_bytes: &[u8], pk: &[u8; 32]) -> Result<(), OracleError> {
    let sig_arr: [u8; 64] = sig_bytes.try_into().map_err(|_| OracleError::BadSignature)?;
    let vk = VerifyingKey::from_bytes(pk).map_err(|_| OracleError::BadSignature)?;
    vk.verify(msg, &Signature::from_bytes(&sig_arr))
        .map_err(|_| OracleError::BadSignature)
}
