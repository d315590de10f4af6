use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use sphinx_core::OracleError;

/// Sample a fresh 32-byte OPRF secret scalar.
pub fn random_key() -> Zeroizing<[u8; 32]> {
    Zeroizing::new(Scalar::random(&mut OsRng).to_bytes())
}

/// Single blinded point evaluation: `beta = key * alpha` over ristretto255.
///
/// `key` must be a canonical non-zero 32-byte scalar and `alpha` a valid
/// compressed point sent by the client; identity results are rejected.
pub fn evaluate(key: &[u8], alpha: &[u8]) -> Result<[u8; 32], OracleError> {
    let key_bytes: [u8; 32] = key.try_into().map_err(|_| OracleError::OprfEval)?;
    let k = Option::<Scalar>::from(Scalar::from_canonical_bytes(key_bytes))
        .ok_or(OracleError::OprfEval)?;
    if k == Scalar::ZERO {
        return Err(OracleError::OprfEval);
    }

    let alpha_bytes: [u8; 32] = alpha.try_into().map_err(|_| OracleError::OprfEval)?;
    let a = CompressedRistretto(alpha_bytes)
        .decompress()
        .ok_or(OracleError::OprfEval)?;

    let beta: RistrettoPoint = a * k;
    if beta.is_identity() {
        return Err(OracleError::OprfEval);
    }
    Ok(beta.compress().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;

    fn blinded_point() -> [u8; 32] {
        let r = Scalar::random(&mut OsRng);
        (RISTRETTO_BASEPOINT_POINT * r).compress().to_bytes()
    }

    #[test]
    fn evaluate_is_deterministic() {
        let k = random_key();
        let alpha = blinded_point();
        let b1 = evaluate(&k[..], &alpha).unwrap();
        let b2 = evaluate(&k[..], &alpha).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn distinct_keys_give_distinct_outputs() {
        let alpha = blinded_point();
        let b1 = evaluate(&random_key()[..], &alpha).unwrap();
        let b2 = evaluate(&random_key()[..], &alpha).unwrap();
        assert_ne!(b1, b2);
    }

    #[test]
    fn invalid_point_is_rejected() {
        let k = random_key();
        // 0xff.. is not a canonical ristretto encoding.
        assert!(evaluate(&k[..], &[0xffu8; 32]).is_err());
        assert!(evaluate(&k[..], &[0u8; 31]).is_err());
    }

    #[test]
    fn zero_scalar_is_rejected() {
        let alpha = blinded_point();
        assert!(evaluate(&[0u8; 32], &alpha).is_err());
    }
}
