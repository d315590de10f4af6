//! Noise-XK sessions between oracle peers, used only by the DKG.
//!
//! XK means the initiator must already know the responder's static key and
//! the responder learns (and must authorize) the initiator's static key in
//! message 3. All handshake messages have fixed sizes, which the DKG
//! coordinator relies on for its lockstep framing.

use curve25519_dalek::montgomery::MontgomeryPoint;
use snow::{Builder, HandshakeState, TransportState};

use sphinx_core::OracleError;

const PATTERN: &str = "Noise_XK_25519_ChaChaPoly_BLAKE2s";

/// `e ‖ AEAD(∅)` from the initiator.
pub const MSG1_LEN: usize = 48;
/// `e ‖ AEAD(∅)` from the responder.
pub const MSG2_LEN: usize = 48;
/// `AEAD(s) ‖ AEAD(∅)` from the initiator.
pub const MSG3_LEN: usize = 64;
/// Per-message AEAD tag overhead in transport mode.
pub const TAG_LEN: usize = 16;

fn noise_err(e: snow::Error) -> OracleError {
    OracleError::PeerAuth(e.to_string())
}

fn builder(privkey: &[u8; 32]) -> Builder<'_> {
    let params = PATTERN.parse().expect("static pattern string is valid");
    Builder::new(params).local_private_key(privkey)
}

/// Derive the X25519 public key for a 32-byte static private key.
pub fn pubkey(privkey: &[u8; 32]) -> [u8; 32] {
    MontgomeryPoint::mul_base_clamped(*privkey).to_bytes()
}

// ── Initiator side ───────────────────────────────────────────────────────────

pub struct InitiatorHandshake {
    hs: HandshakeState,
}

/// Open a session toward `peer_pub`. Returns the handshake state and the
/// 48-byte first message.
pub fn initiate(
    privkey: &[u8; 32],
    peer_pub: &[u8; 32],
) -> Result<(InitiatorHandshake, Vec<u8>), OracleError> {
    let mut hs = builder(privkey)
        .remote_public_key(peer_pub)
        .build_initiator()
        .map_err(noise_err)?;
    let mut buf = [0u8; 128];
    let len = hs.write_message(&[], &mut buf).map_err(noise_err)?;
    debug_assert_eq!(len, MSG1_LEN);
    Ok((InitiatorHandshake { hs }, buf[..len].to_vec()))
}

impl InitiatorHandshake {
    /// Consume the responder's 48-byte reply; produce the 64-byte final
    /// message and the transport session.
    pub fn complete(mut self, msg2: &[u8]) -> Result<(Vec<u8>, PeerSession), OracleError> {
        let mut scratch = [0u8; 128];
        self.hs.read_message(msg2, &mut scratch).map_err(noise_err)?;
        let mut buf = [0u8; 128];
        let len = self.hs.write_message(&[], &mut buf).map_err(noise_err)?;
        debug_assert_eq!(len, MSG3_LEN);
        let transport = self.hs.into_transport_mode().map_err(noise_err)?;
        Ok((buf[..len].to_vec(), PeerSession { transport }))
    }
}

// ── Responder side ───────────────────────────────────────────────────────────

pub struct ResponderHandshake {
    hs: HandshakeState,
}

/// Answer a peer's 48-byte first message with our 48-byte reply.
pub fn respond(
    privkey: &[u8; 32],
    msg1: &[u8],
) -> Result<(ResponderHandshake, Vec<u8>), OracleError> {
    let mut hs = builder(privkey).build_responder().map_err(noise_err)?;
    let mut scratch = [0u8; 128];
    hs.read_message(msg1, &mut scratch).map_err(noise_err)?;
    let mut buf = [0u8; 128];
    let len = hs.write_message(&[], &mut buf).map_err(noise_err)?;
    debug_assert_eq!(len, MSG2_LEN);
    Ok((ResponderHandshake { hs }, buf[..len].to_vec()))
}

impl ResponderHandshake {
    /// Consume the initiator's final message. The now-revealed static key
    /// must be on the authorized-peers list.
    pub fn complete(
        mut self,
        msg3: &[u8],
        authorized: &[[u8; 32]],
    ) -> Result<PeerSession, OracleError> {
        let mut scratch = [0u8; 128];
        self.hs.read_message(msg3, &mut scratch).map_err(noise_err)?;
        let remote = self
            .hs
            .get_remote_static()
            .ok_or_else(|| OracleError::PeerAuth("initiator sent no static key".into()))?;
        if !authorized.iter().any(|k| k[..] == *remote) {
            return Err(OracleError::PeerAuth("initiator static key not authorized".into()));
        }
        let transport = self.hs.into_transport_mode().map_err(noise_err)?;
        Ok(PeerSession { transport })
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// An established session with one peer; one direction of the DKG share
/// exchange.
pub struct PeerSession {
    transport: TransportState,
}

impl PeerSession {
    /// Encrypt one message; the ciphertext is `plaintext.len() + TAG_LEN`.
    pub fn send(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, OracleError> {
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        let len = self
            .transport
            .write_message(plaintext, &mut buf)
            .map_err(noise_err)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Decrypt one message received from the peer.
    pub fn recv(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, OracleError> {
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(ciphertext, &mut buf)
            .map_err(noise_err)?;
        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let mut sk = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut sk);
        let pk = pubkey(&sk);
        (sk, pk)
    }

    #[test]
    fn xk_handshake_and_transport() {
        let (initiator_sk, initiator_pk) = keypair();
        let (responder_sk, responder_pk) = keypair();

        let (ihs, msg1) = initiate(&initiator_sk, &responder_pk).unwrap();
        assert_eq!(msg1.len(), MSG1_LEN);

        let (rhs, msg2) = respond(&responder_sk, &msg1).unwrap();
        assert_eq!(msg2.len(), MSG2_LEN);

        let (msg3, mut tx) = ihs.complete(&msg2).unwrap();
        assert_eq!(msg3.len(), MSG3_LEN);

        let mut rx = rhs.complete(&msg3, &[initiator_pk]).unwrap();

        let share = [0x42u8; 33];
        let ct = tx.send(&share).unwrap();
        assert_eq!(ct.len(), share.len() + TAG_LEN);
        assert_eq!(rx.recv(&ct).unwrap(), share);
    }

    #[test]
    fn unauthorized_initiator_is_rejected() {
        let (initiator_sk, _) = keypair();
        let (responder_sk, responder_pk) = keypair();
        let (_, somebody_else) = keypair();

        let (ihs, msg1) = initiate(&initiator_sk, &responder_pk).unwrap();
        let (rhs, msg2) = respond(&responder_sk, &msg1).unwrap();
        let (msg3, _) = ihs.complete(&msg2).unwrap();

        assert!(rhs.complete(&msg3, &[somebody_else]).is_err());
    }

    #[test]
    fn tampered_transport_message_fails() {
        let (initiator_sk, initiator_pk) = keypair();
        let (responder_sk, responder_pk) = keypair();

        let (ihs, msg1) = initiate(&initiator_sk, &responder_pk).unwrap();
        let (rhs, msg2) = respond(&responder_sk, &msg1).unwrap();
        let (msg3, mut tx) = ihs.complete(&msg2).unwrap();
        let mut rx = rhs.complete(&msg3, &[initiator_pk]).unwrap();

        let mut ct = tx.send(&[1, 2, 3]).unwrap();
        ct[0] ^= 1;
        assert!(rx.recv(&ct).is_err());
    }
}
