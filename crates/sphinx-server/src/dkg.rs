//! DKG coordinator: drives one distributed key generation over the single
//! client-mediated stream.
//!
//! The client relays every broadcast between the n participating oracles,
//! so all framing is lockstep: each phase writes one fixed-size message
//! and reads n of them back. Peer-to-peer confidentiality comes from the
//! Noise-XK mesh established first; the relay sees only ciphertext for the
//! share exchange.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use zeroize::Zeroizing;

use sphinx_core::{OracleError, KEY_SIZE};
use sphinx_crypto::dkg::{signed_commitment_size, DkgParticipant, SHARE_SIZE};
use sphinx_crypto::noise::{self, PeerSession, MSG1_LEN, MSG2_LEN, MSG3_LEN, TAG_LEN};

use crate::wire::Framed;

#[derive(Debug, Clone)]
pub struct DkgConfig {
    pub noisekey: PathBuf,
    pub authorized_keys: PathBuf,
}

/// Run the whole DKG; returns the 33-byte indexed key share.
pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    config: &DkgConfig,
    n: u8,
    t: u8,
    index: u8,
    aux: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, OracleError> {
    if n == 0 || t == 0 || t > n || index == 0 || index > n {
        return Err(OracleError::PeerAuth(format!(
            "invalid dkg parameters: n={n} t={t} index={index}"
        )));
    }

    let privkey = load_noise_key(&config.noisekey)?;
    let auth_keys = load_authorized_keys(&config.authorized_keys)?;
    let (mut senders, mut receivers) =
        setup_noise_sessions(framed, n, &privkey, &auth_keys).await?;

    // Fresh signing identity for this session; pubkeys are exchanged
    // through the relay like every other broadcast.
    let sk = SigningKey::generate(&mut OsRng);
    framed.send(&sk.verifying_key().to_bytes()).await?;
    let pks = read_chunks::<32, S>(framed, n).await?;

    let (mut participant, deal) = DkgParticipant::start(n, t, index, &sk)?;
    participant.mix_aux(aux);

    framed.send(&deal.c_hash).await?;
    let c_hashes = read_chunks::<32, S>(framed, n).await?;

    framed.send(&deal.signed_commitment).await?;
    let sc_size = signed_commitment_size(t);
    let flat = framed.read_exact(sc_size * n as usize).await?;
    let signed_commitments: Vec<Vec<u8>> =
        flat.chunks_exact(sc_size).map(|c| c.to_vec()).collect();

    // Encrypted share exchange: one ciphertext per peer, in peer order.
    let mut out = Vec::with_capacity((SHARE_SIZE + TAG_LEN) * n as usize);
    for (share, session) in deal.shares.iter().zip(senders.iter_mut()) {
        out.extend_from_slice(&session.send(share)?);
    }
    framed.send(&out).await?;

    let ct_size = SHARE_SIZE + TAG_LEN;
    let cts = framed.read_exact(ct_size * n as usize).await?;
    let mut shares = Vec::with_capacity(n as usize);
    for (ct, session) in cts.chunks_exact(ct_size).zip(receivers.iter_mut()) {
        let pt = session.recv(ct)?;
        let share: [u8; SHARE_SIZE] = pt
            .try_into()
            .map_err(|_| OracleError::PeerAuth("peer sent a malformed share".into()))?;
        shares.push(share);
    }

    let complaints =
        participant.verify_commitments(&c_hashes, &signed_commitments, &pks, &shares)?;
    let mut msg = Vec::with_capacity(1 + complaints.len());
    msg.push(complaints.len() as u8);
    msg.extend_from_slice(&complaints);
    framed.send(&msg).await?;
    if !complaints.is_empty() {
        // No recovery: a dealer that failed verification kills the session.
        return Err(OracleError::PeerAuth(format!(
            "dkg complaints against dealers {complaints:?}"
        )));
    }

    let (share, transcript) = participant.finish(&shares)?;
    debug!(transcript = %hex::encode(transcript), "dkg complete");
    Ok(share)
}

/// Establish the Noise-XK mesh: n outbound (sender) and n inbound
/// (receiver) sessions, in the peer order fixed by the pubkey list.
async fn setup_noise_sessions<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    n: u8,
    privkey: &[u8; 32],
    auth_keys: &[([u8; 32], String)],
) -> Result<(Vec<PeerSession>, Vec<PeerSession>), OracleError> {
    framed.send(&noise::pubkey(privkey)).await?;

    let pubkeys = read_chunks::<32, S>(framed, n).await?;
    let distinct: HashSet<&[u8; 32]> = pubkeys.iter().collect();
    if distinct.len() != n as usize {
        return Err(OracleError::PeerAuth(format!(
            "expected {n} distinct peer noise keys, got {}",
            distinct.len()
        )));
    }

    // Initiate toward every peer.
    let mut handshakes = Vec::with_capacity(n as usize);
    let mut msg1s = Vec::with_capacity(MSG1_LEN * n as usize);
    for pk in &pubkeys {
        let (hs, msg1) = noise::initiate(privkey, pk)?;
        handshakes.push(hs);
        msg1s.extend_from_slice(&msg1);
    }
    framed.send(&msg1s).await?;

    // Respond to every peer's initiation.
    let peer_msg1s = framed.read_exact(MSG1_LEN * n as usize).await?;
    let mut responders = Vec::with_capacity(n as usize);
    let mut msg2s = Vec::with_capacity(MSG2_LEN * n as usize);
    for msg1 in peer_msg1s.chunks_exact(MSG1_LEN) {
        let (responder, msg2) = noise::respond(privkey, msg1)?;
        responders.push(responder);
        msg2s.extend_from_slice(&msg2);
    }
    framed.send(&msg2s).await?;

    // Finish our outbound handshakes.
    let peer_msg2s = framed.read_exact(MSG2_LEN * n as usize).await?;
    let mut senders = Vec::with_capacity(n as usize);
    let mut msg3s = Vec::with_capacity(MSG3_LEN * n as usize);
    for (msg2, hs) in peer_msg2s.chunks_exact(MSG2_LEN).zip(handshakes) {
        let (msg3, session) = hs.complete(msg2)?;
        msg3s.extend_from_slice(&msg3);
        senders.push(session);
    }
    framed.send(&msg3s).await?;

    // Finish the inbound handshakes; each initiator's static key must be
    // on the allowlist.
    let allow: Vec<[u8; 32]> = auth_keys.iter().map(|(k, _)| *k).collect();
    let peer_msg3s = framed.read_exact(MSG3_LEN * n as usize).await?;
    let mut receivers = Vec::with_capacity(n as usize);
    for (msg3, responder) in peer_msg3s.chunks_exact(MSG3_LEN).zip(responders) {
        receivers.push(responder.complete(msg3, &allow)?);
    }

    Ok((senders, receivers))
}

async fn read_chunks<const N: usize, S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    n: u8,
) -> Result<Vec<[u8; N]>, OracleError> {
    let flat = framed.read_exact(N * n as usize).await?;
    Ok(flat
        .chunks_exact(N)
        .map(|c| c.try_into().expect("chunks_exact(N)"))
        .collect())
}

// ── Key material on disk ─────────────────────────────────────────────────────

/// The oracle's Noise static private key: 32 raw bytes.
pub fn load_noise_key(path: &Path) -> Result<Zeroizing<[u8; 32]>, OracleError> {
    let bytes = Zeroizing::new(std::fs::read(path)?);
    if bytes.len() != 32 {
        return Err(OracleError::StorageCorruption(format!(
            "noise key {} is {} bytes, expected 32",
            path.display(),
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Authorized peer list: one `<base64 static pub> <name>` per line.
pub fn load_authorized_keys(path: &Path) -> Result<Vec<([u8; 32], String)>, OracleError> {
    let text = std::fs::read_to_string(path)?;
    let mut keys = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = || {
            OracleError::StorageCorruption(format!(
                "{}:{}: malformed authorized key",
                path.display(),
                lineno + 1
            ))
        };
        let (b64, name) = line.split_once(' ').ok_or_else(malformed)?;
        let decoded = BASE64.decode(b64).map_err(|_| malformed())?;
        let key: [u8; 32] = decoded.try_into().map_err(|_| malformed())?;
        keys.push((key, name.trim().to_string()));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn authorized_keys_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let key_a = [0x11u8; 32];
        let key_b = [0x22u8; 32];
        writeln!(file, "{} oracle-a", BASE64.encode(key_a)).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{} oracle-b.example.org", BASE64.encode(key_b)).unwrap();

        let keys = load_authorized_keys(file.path()).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], (key_a, "oracle-a".to_string()));
        assert_eq!(keys[1], (key_b, "oracle-b.example.org".to_string()));
    }

    #[test]
    fn authorized_keys_rejects_nameless_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", BASE64.encode([0x11u8; 32])).unwrap();
        assert!(load_authorized_keys(file.path()).is_err());
    }

    #[test]
    fn noise_key_must_be_32_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 31]).unwrap();
        assert!(load_noise_key(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 32]).unwrap();
        assert_eq!(&load_noise_key(file.path()).unwrap()[..], &[7u8; 32]);
    }
}
