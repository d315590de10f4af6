//! Feldman-style distributed key generation over ristretto255.
//!
//! Each of `n` participants deals a random degree `t-1` polynomial: it
//! broadcasts a hash of its coefficient commitments, then the signed
//! commitments themselves, and sends share `f(i)` to participant `i`
//! through an encrypted peer channel. A participant's final key share is
//! the sum of the shares dealt to its index; any `t` such shares determine
//! the joint secret, which no single party ever sees.
//!
//! The exchange is two-phase (hash first, then commitment) so nobody can
//! choose their polynomial after seeing the others'. Dealers whose
//! commitment, signature or share fails verification end up in the
//! complaint vector; this implementation treats any complaint as grounds
//! to abort the surrounding operation.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use sphinx_core::{OracleError, SIG_SIZE};

use crate::sign;

/// `index[1] ‖ scalar[32]`, 1-based index.
pub const SHARE_SIZE: usize = 33;

/// Compressed commitment points, one per polynomial coefficient.
pub fn commitment_size(t: u8) -> usize {
    32 * t as usize
}

/// Commitment followed by a detached Ed25519 signature over it.
pub fn signed_commitment_size(t: u8) -> usize {
    commitment_size(t) + SIG_SIZE
}

/// The public output of one participant's dealing phase.
pub struct DkgDeal {
    /// blake3 of the commitment, broadcast before the commitment itself.
    pub c_hash: [u8; 32],
    /// `commitment ‖ sig[64]`.
    pub signed_commitment: Vec<u8>,
    /// `shares[i]` goes to participant `i + 1`.
    pub shares: Vec<[u8; SHARE_SIZE]>,
}

pub struct DkgParticipant {
    n: u8,
    t: u8,
    index: u8,
    transcript: blake3::Hasher,
}

impl DkgParticipant {
    /// Deal a fresh polynomial for an `n`-participant, threshold-`t` session
    /// as participant `index` (1-based). `sk` signs the commitment.
    pub fn start(
        n: u8,
        t: u8,
        index: u8,
        sk: &SigningKey,
    ) -> Result<(Self, DkgDeal), OracleError> {
        if n == 0 || t == 0 || t > n || index == 0 || index > n {
            return Err(OracleError::PeerAuth(format!(
                "invalid dkg parameters: n={n} t={t} index={index}"
            )));
        }

        let coeffs: Zeroizing<Vec<Scalar>> = Zeroizing::new(
            (0..t).map(|_| Scalar::random(&mut OsRng)).collect(),
        );

        let mut commitment = Vec::with_capacity(commitment_size(t));
        for c in coeffs.iter() {
            commitment.extend_from_slice(RistrettoPoint::mul_base(c).compress().as_bytes());
        }
        let c_hash = *blake3::hash(&commitment).as_bytes();

        let mut signed_commitment = commitment;
        let sig = sk.sign(&signed_commitment);
        signed_commitment.extend_from_slice(&sig.to_bytes());

        let shares = (1..=n)
            .map(|i| {
                let mut share = [0u8; SHARE_SIZE];
                share[0] = i;
                share[1..].copy_from_slice(&poly_eval(&coeffs, i).to_bytes());
                share
            })
            .collect();

        let mut transcript = blake3::Hasher::new();
        transcript.update(b"sphinx-dkg-v1");
        transcript.update(&[n, t]);
        transcript.update(&c_hash);

        let participant = Self { n, t, index, transcript };
        Ok((participant, DkgDeal { c_hash, signed_commitment, shares }))
    }

    /// Bind the session transcript to the operation that triggered it.
    pub fn mix_aux(&mut self, aux: &[u8]) {
        self.transcript.update(aux);
    }

    /// Check every dealer's commitment hash, signature and the share it
    /// dealt to us. Returns the 1-based indices of misbehaving dealers;
    /// an empty vector means the session is consistent.
    pub fn verify_commitments(
        &mut self,
        c_hashes: &[[u8; 32]],
        signed_commitments: &[Vec<u8>],
        pks: &[[u8; 32]],
        shares: &[[u8; SHARE_SIZE]],
    ) -> Result<Vec<u8>, OracleError> {
        let n = self.n as usize;
        if c_hashes.len() != n || signed_commitments.len() != n || pks.len() != n || shares.len() != n
        {
            return Err(OracleError::WrongLength { expected: n, got: c_hashes.len() });
        }

        for ch in c_hashes {
            self.transcript.update(ch);
        }
        for sc in signed_commitments {
            self.transcript.update(sc);
        }
        for pk in pks {
            self.transcript.update(pk);
        }

        let mut complaints = Vec::new();
        for dealer in 0..n {
            if !self.dealer_is_consistent(
                &c_hashes[dealer],
                &signed_commitments[dealer],
                &pks[dealer],
                &shares[dealer],
            ) {
                complaints.push(dealer as u8 + 1);
            }
        }
        Ok(complaints)
    }

    fn dealer_is_consistent(
        &self,
        c_hash: &[u8; 32],
        signed_commitment: &[u8],
        pk: &[u8; 32],
        share: &[u8; SHARE_SIZE],
    ) -> bool {
        if signed_commitment.len() != signed_commitment_size(self.t) {
            return false;
        }
        let commitment = match sign::verify_blob(signed_commitment, pk) {
            Ok(body) => body,
            Err(_) => return false,
        };
        if blake3::hash(commitment).as_bytes() != c_hash {
            return false;
        }
        let points = match parse_points(commitment) {
            Some(p) => p,
            None => return false,
        };

        if share[0] != self.index {
            return false;
        }
        let share_bytes: [u8; 32] = share[1..].try_into().expect("share is 33 bytes");
        let s = match Option::<Scalar>::from(Scalar::from_canonical_bytes(share_bytes)) {
            Some(s) => s,
            None => return false,
        };

        // g·s must equal Σ C_k · index^k.
        let x = Scalar::from(self.index as u64);
        let mut expected = RistrettoPoint::identity();
        let mut x_pow = Scalar::ONE;
        for point in &points {
            expected += point * x_pow;
            x_pow *= x;
        }
        RistrettoPoint::mul_base(&s) == expected
    }

    /// Sum the received shares into this participant's final key share.
    /// Also returns the transcript digest binding the whole session.
    pub fn finish(
        self,
        shares: &[[u8; SHARE_SIZE]],
    ) -> Result<(Zeroizing<[u8; SHARE_SIZE]>, [u8; 32]), OracleError> {
        if shares.len() != self.n as usize {
            return Err(OracleError::WrongLength { expected: self.n as usize, got: shares.len() });
        }
        let mut sum = Scalar::ZERO;
        for share in shares {
            let bytes: [u8; 32] = share[1..].try_into().expect("share is 33 bytes");
            let s = Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes))
                .ok_or_else(|| OracleError::PeerAuth("non-canonical dkg share".into()))?;
            sum += s;
        }
        let mut out = Zeroizing::new([0u8; SHARE_SIZE]);
        out[0] = self.index;
        out[1..].copy_from_slice(&sum.to_bytes());
        Ok((out, *self.transcript.finalize().as_bytes()))
    }
}

fn poly_eval(coeffs: &[Scalar], x: u8) -> Scalar {
    let x = Scalar::from(x as u64);
    coeffs.iter().rev().fold(Scalar::ZERO, |acc, c| acc * x + c)
}

fn parse_points(commitment: &[u8]) -> Option<Vec<RistrettoPoint>> {
    if commitment.len() % 32 != 0 {
        return None;
    }
    commitment
        .chunks_exact(32)
        .map(|chunk| {
            let bytes: [u8; 32] = chunk.try_into().expect("chunks_exact(32)");
            CompressedRistretto(bytes).decompress()
        })
        .collect()
}
