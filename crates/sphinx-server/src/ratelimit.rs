//! Adaptive proof-of-work rate limiter.
//!
//! Every operation on an existing account is gated by an Equihash puzzle.
//! The server stores only a 9-byte per-account difficulty counter and one
//! process-wide MAC key; the challenge itself is self-authenticating, so
//! CHALLENGE_CREATE and CHALLENGE_VERIFY can land on different workers.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

use sphinx_core::{
    consts, AccountId, OracleError, CHALLENGE_SIZE, DIFFICULTIES, DIFFICULTY_SIZE, MAC_SIZE, READ,
};
use sphinx_crypto::{challenge_mac, mac_verify, pow};
use sphinx_store::RecordStore;

use crate::wire::Framed;

pub const DIFFICULTY_RECORD: &str = "difficulty";

#[derive(Debug, Clone, Copy)]
pub struct RateLimitParams {
    pub decay: u64,
    pub threshold: u32,
    pub gracetime: u64,
}

// ── Request ──────────────────────────────────────────────────────────────────

/// A rate-limited request: `op ‖ id` for READ, `op ‖ id ‖ alpha` otherwise.
/// The raw byte form feeds the challenge MAC and the Equihash seed.
#[derive(Debug, Clone)]
pub struct Request {
    pub op: u8,
    pub id: AccountId,
    pub alpha: Option<[u8; 32]>,
    raw: Vec<u8>,
}

impl Request {
    pub fn new(op: u8, id: AccountId, alpha: Option<[u8; 32]>) -> Self {
        let mut raw = Vec::with_capacity(65);
        raw.push(op);
        raw.extend_from_slice(id.as_bytes());
        if let Some(a) = &alpha {
            raw.extend_from_slice(a);
        }
        Self { op, id, alpha, raw }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    async fn read_from<S: AsyncRead + AsyncWrite + Unpin>(
        framed: &mut Framed<S>,
    ) -> Result<Self, OracleError> {
        let op = framed.read_u8().await?;
        let id = AccountId::from_bytes(framed.read_array::<32>().await?);
        let alpha = if op == READ {
            None
        } else {
            Some(framed.read_array::<32>().await?)
        };
        Ok(Self::new(op, id, alpha))
    }
}

// ── Difficulty record ────────────────────────────────────────────────────────

/// `level[1] ‖ count[4] ‖ ts[4]`, little-endian integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifficultyRecord {
    pub level: u8,
    pub count: u32,
    pub ts: u32,
}

impl DifficultyRecord {
    pub fn encode(&self) -> [u8; DIFFICULTY_SIZE] {
        let mut out = [0u8; DIFFICULTY_SIZE];
        out[0] = self.level;
        out[1..5].copy_from_slice(&self.count.to_le_bytes());
        out[5..9].copy_from_slice(&self.ts.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OracleError> {
        if bytes.len() != DIFFICULTY_SIZE {
            return Err(OracleError::StorageCorruption(format!(
                "difficulty record is {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            level: bytes[0],
            count: u32::from_le_bytes(bytes[1..5].try_into().expect("4 bytes")),
            ts: u32::from_le_bytes(bytes[5..9].try_into().expect("4 bytes")),
        })
    }
}

/// Advance the per-account difficulty state for one CHALLENGE_CREATE.
///
/// Order matters: clamp an out-of-range level first, then decay on long
/// silence, otherwise escalate once `count` crosses the threshold.
fn advance(prior: Option<DifficultyRecord>, now: u64, params: &RateLimitParams) -> (usize, u32) {
    let top = DIFFICULTIES.len() - 1;
    let Some(rec) = prior else {
        return (0, 0);
    };

    let mut level = rec.level as usize;
    let mut count = rec.count;
    if level > top {
        debug!(level, "clamping out-of-range rate-limit level");
        level = top;
        count = 0;
    } else if now > rec.ts as u64 + params.decay && level > 0 {
        let periods = ((now - rec.ts as u64) / params.decay) as usize;
        level = level.saturating_sub(periods);
        count = 0;
    } else if count >= params.threshold && level < top {
        level += 1;
        count = 0;
    } else {
        count += 1;
    }
    (level, count)
}

// ── CHALLENGE_CREATE ─────────────────────────────────────────────────────────

pub async fn create_challenge<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    store: &RecordStore,
    params: &RateLimitParams,
) -> Result<(), OracleError> {
    let req = Request::read_from(framed).await?;
    let now = unix_now();

    let prior = match store.load(&req.id, DIFFICULTY_RECORD, Some(DIFFICULTY_SIZE))? {
        Some(bytes) => Some(DifficultyRecord::decode(&bytes)?),
        None => None,
    };
    let (level, count) = advance(prior, now, params);
    let difficulty = DIFFICULTIES[level];

    if level == DIFFICULTIES.len() - 1 && count > params.threshold * 2 {
        error!(
            id = %req.id,
            count,
            "rate limit saturated: someone is trying really hard on this account"
        );
    }

    let record = DifficultyRecord { level: level as u8, count, ts: now as u32 };
    debug!(level, count, ts = now, "rate-limit difficulty");
    if let Err(e) = store.save(&req.id, DIFFICULTY_RECORD, &record.encode()) {
        // An id nobody enrolled has no directory; probing it must leave no
        // trace, so only a previously recorded account propagates the error.
        if prior.is_some() {
            return Err(e);
        }
        debug!(id = %req.id, "skipping difficulty record for unknown account");
    }

    let mut challenge = [0u8; CHALLENGE_SIZE];
    challenge[0] = difficulty.n;
    challenge[1] = difficulty.k;
    challenge[2..].copy_from_slice(&now.to_le_bytes());

    let key = store.load_or_create_mac_key()?;
    let sig = challenge_mac(&key, req.raw(), &challenge);

    let mut resp = Vec::with_capacity(CHALLENGE_SIZE + MAC_SIZE);
    resp.extend_from_slice(&challenge);
    resp.extend_from_slice(&sig);
    framed.send(&resp).await
}

// ── CHALLENGE_VERIFY ─────────────────────────────────────────────────────────

/// Check the returned challenge, its MAC, its age and the Equihash solution.
/// On success the embedded request is handed back for dispatch.
pub async fn verify_challenge<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    store: &RecordStore,
    params: &RateLimitParams,
) -> Result<Request, OracleError> {
    let challenge = framed.read_array::<CHALLENGE_SIZE>().await?;
    let sig = framed.read_array::<MAC_SIZE>().await?;
    let req = Request::read_from(framed).await?;

    let key = store.load_mac_key()?.ok_or(OracleError::BadMac)?;
    let expected = challenge_mac(&key, req.raw(), &challenge);
    if !mac_verify(&expected, &sig) {
        return Err(OracleError::BadMac);
    }

    let n = challenge[0];
    let k = challenge[1];
    let ts = u64::from_le_bytes(challenge[2..].try_into().expect("8 bytes"));
    let timeout = consts::ladder_timeout(n, k).ok_or(OracleError::MalformedFraming)?;
    if unix_now().saturating_sub(ts) > timeout + params.gracetime {
        return Err(OracleError::StaleChallenge);
    }

    let solution = framed.read_exact(pow::solsize(n, k)).await?;
    let mut seed = challenge.to_vec();
    seed.extend_from_slice(req.raw());
    if !pow::verify(n, k, &seed, &solution) {
        return Err(OracleError::BadSolution);
    }
    Ok(req)
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sphinx_core::GET;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const PARAMS: RateLimitParams = RateLimitParams { decay: 1800, threshold: 1, gracetime: 10 };

    fn store() -> (tempfile::TempDir, RecordStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::new(tmp.path().join("data"));
        (tmp, store)
    }

    fn test_id(b: u8) -> AccountId {
        AccountId::from_bytes([b; 32])
    }

    /// Drive one CHALLENGE_CREATE; returns the 42-byte response.
    async fn issue(store: &RecordStore, req: &Request) -> Vec<u8> {
        let (mut client, server) = tokio::io::duplex(256);
        let mut framed = Framed::new(server, Duration::from_secs(1));
        client.write_all(req.raw()).await.unwrap();

        create_challenge(&mut framed, store, &PARAMS).await.unwrap();
        let mut resp = vec![0u8; CHALLENGE_SIZE + MAC_SIZE];
        client.read_exact(&mut resp).await.unwrap();
        resp
    }

    async fn run_verify(
        store: &RecordStore,
        challenge: &[u8],
        sig: &[u8],
        req: &Request,
        solution: &[u8],
    ) -> Result<Request, OracleError> {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut framed = Framed::new(server, Duration::from_secs(1));
        let mut wire = challenge.to_vec();
        wire.extend_from_slice(sig);
        wire.extend_from_slice(req.raw());
        wire.extend_from_slice(solution);
        client.write_all(&wire).await.unwrap();

        verify_challenge(&mut framed, store, &PARAMS).await
    }

    #[tokio::test]
    async fn fresh_id_starts_at_level_zero_and_leaves_no_trace() {
        let (_tmp, store) = store();
        let req = Request::new(GET, test_id(1), Some([9u8; 32]));

        let resp = issue(&store, &req).await;
        assert_eq!(resp[0], 60);
        assert_eq!(resp[1], 4);

        // No account dir, so no difficulty record may be left behind.
        assert!(!store.account_exists(&req.id));
    }

    #[tokio::test]
    async fn challenge_mac_is_valid_and_bound_to_request() {
        let (_tmp, store) = store();
        let req = Request::new(GET, test_id(2), Some([9u8; 32]));
        let resp = issue(&store, &req).await;

        let key = store.load_mac_key().unwrap().unwrap();
        let expected = challenge_mac(&key, req.raw(), &resp[..CHALLENGE_SIZE]);
        assert_eq!(&resp[CHALLENGE_SIZE..], &expected);

        let other = Request::new(GET, test_id(3), Some([9u8; 32]));
        assert_ne!(&resp[CHALLENGE_SIZE..], &challenge_mac(&key, other.raw(), &resp[..CHALLENGE_SIZE]));
    }

    #[tokio::test]
    async fn repeated_challenges_escalate_one_rung() {
        let (_tmp, store) = store();
        let id = test_id(4);
        store.create_account_dir(&id).unwrap();
        let req = Request::new(GET, id, Some([9u8; 32]));

        // threshold = 1: first records (0,0), second bumps count, third
        // advances the ladder.
        assert_eq!(issue(&store, &req).await[0], 60);
        assert_eq!(issue(&store, &req).await[0], 60);
        assert_eq!(issue(&store, &req).await[0], 65);
    }

    #[tokio::test]
    async fn silence_decays_difficulty() {
        let (_tmp, store) = store();
        let id = test_id(5);
        store.create_account_dir(&id).unwrap();

        let stale = DifficultyRecord {
            level: 3,
            count: 7,
            ts: (unix_now() - 2 * PARAMS.decay - 1) as u32,
        };
        store.save(&id, DIFFICULTY_RECORD, &stale.encode()).unwrap();

        let req = Request::new(GET, id, Some([9u8; 32]));
        let resp = issue(&store, &req).await;
        // Two full decay periods: level 3 → 1.
        assert_eq!(resp[0], DIFFICULTIES[1].n);

        let rec = DifficultyRecord::decode(
            &store.load(&req.id, DIFFICULTY_RECORD, Some(DIFFICULTY_SIZE)).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(rec.level, 1);
        assert_eq!(rec.count, 0);
    }

    #[tokio::test]
    async fn out_of_range_level_is_clamped_to_top() {
        let (_tmp, store) = store();
        let id = test_id(6);
        store.create_account_dir(&id).unwrap();

        let bogus = DifficultyRecord { level: 200, count: 9, ts: unix_now() as u32 };
        store.save(&id, DIFFICULTY_RECORD, &bogus.encode()).unwrap();

        let req = Request::new(GET, id, Some([9u8; 32]));
        let resp = issue(&store, &req).await;
        assert_eq!(resp[0], DIFFICULTIES.last().unwrap().n);
    }

    #[test]
    fn level_saturates_and_count_keeps_growing() {
        let now = unix_now();
        let top = DIFFICULTIES.len() - 1;
        let rec = DifficultyRecord { level: top as u8, count: 10, ts: now as u32 };
        let (level, count) = advance(Some(rec), now, &PARAMS);
        assert_eq!(level, top);
        assert_eq!(count, 11);
    }

    #[tokio::test]
    async fn verify_rejects_bad_mac() {
        let (_tmp, store) = store();
        let req = Request::new(GET, test_id(7), Some([9u8; 32]));
        let resp = issue(&store, &req).await;

        let mut sig = resp[CHALLENGE_SIZE..].to_vec();
        sig[0] ^= 1;
        let solution = vec![0u8; pow::solsize(resp[0], resp[1])];
        assert!(matches!(
            run_verify(&store, &resp[..CHALLENGE_SIZE], &sig, &req, &solution).await,
            Err(OracleError::BadMac)
        ));
    }

    #[tokio::test]
    async fn verify_age_boundary() {
        let (_tmp, store) = store();
        let req = Request::new(GET, test_id(8), Some([9u8; 32]));
        store.load_or_create_mac_key().unwrap();
        let key = store.load_mac_key().unwrap().unwrap();

        let age_limit = consts::ladder_timeout(60, 4).unwrap() + PARAMS.gracetime;
        let solution = vec![0u8; pow::solsize(60, 4)];

        // Exactly at the limit: freshness passes, the garbage solution is
        // what gets rejected.
        let mut challenge = [0u8; CHALLENGE_SIZE];
        challenge[0] = 60;
        challenge[1] = 4;
        challenge[2..].copy_from_slice(&(unix_now() - age_limit).to_le_bytes());
        let sig = challenge_mac(&key, req.raw(), &challenge);
        assert!(matches!(
            run_verify(&store, &challenge, &sig, &req, &solution).await,
            Err(OracleError::BadSolution)
        ));

        // One second past the limit: stale.
        challenge[2..].copy_from_slice(&(unix_now() - age_limit - 1).to_le_bytes());
        let sig = challenge_mac(&key, req.raw(), &challenge);
        assert!(matches!(
            run_verify(&store, &challenge, &sig, &req, &solution).await,
            Err(OracleError::StaleChallenge)
        ));
    }

    #[test]
    fn difficulty_record_round_trip() {
        let rec = DifficultyRecord { level: 5, count: 0x01020304, ts: 0x0a0b0c0d };
        let bytes = rec.encode();
        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(DifficultyRecord::decode(&bytes).unwrap(), rec);
        assert!(DifficultyRecord::decode(&bytes[..8]).is_err());
    }
}
