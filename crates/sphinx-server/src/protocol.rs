//! Per-account protocol state machine.
//!
//! The first byte of a connection selects CREATE, CREATE_DKG,
//! CHALLENGE_CREATE or CHALLENGE_VERIFY; everything else rides inside a
//! verified CHALLENGE_VERIFY and is dispatched here. All errors bubble up
//! to the connection worker, which answers with the fail marker; the wire
//! never explains *why* something failed.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use zeroize::Zeroizing;

use sphinx_core::{
    AccountId, OracleError, AUTH_MARKER, CHALLENGE_CREATE, CHALLENGE_VERIFY, CHANGE, CHANGE_DKG,
    COMMIT, CREATE, CREATE_DKG, DELETE, GET, KEY_SIZE, NONCE_SIZE, OK_MARKER, PUB_SIZE, READ,
    RULE_SIZE, SIG_SIZE, UNDO,
};
use sphinx_crypto::{oprf, sign};
use sphinx_store::RecordStore;

use crate::dkg::{self, DkgConfig};
use crate::hostblob;
use crate::ratelimit::{self, RateLimitParams, Request};
use crate::wire::Framed;

pub struct Oracle {
    pub store: RecordStore,
    pub rl: RateLimitParams,
    pub dkg: DkgConfig,
}

#[derive(Debug, Clone, Copy)]
enum Rotation {
    Commit,
    Undo,
}

impl Rotation {
    /// Suffix of the triple being promoted to live.
    fn staged(self) -> &'static str {
        match self {
            Rotation::Commit => "new",
            Rotation::Undo => "old",
        }
    }

    /// Suffix the current live triple is preserved under.
    fn preserved(self) -> &'static str {
        match self {
            Rotation::Commit => "old",
            Rotation::Undo => "new",
        }
    }
}

impl Oracle {
    // ── Entry point ──────────────────────────────────────────────────────────

    /// Handle exactly one connection's worth of protocol.
    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
    ) -> Result<(), OracleError> {
        let op = framed.read_u8().await?;
        match op {
            CREATE => self.create(framed).await,
            CREATE_DKG => self.create_dkg(framed).await,
            CHALLENGE_CREATE => {
                ratelimit::create_challenge(framed, &self.store, &self.rl).await
            }
            CHALLENGE_VERIFY => {
                let req = ratelimit::verify_challenge(framed, &self.store, &self.rl).await?;
                self.dispatch(framed, req).await
            }
            other => {
                debug!("unknown opcode {other:#04x}");
                Err(OracleError::MalformedFraming)
            }
        }
    }

    /// Dispatch a request that already passed the rate limiter.
    pub async fn dispatch<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        req: Request,
    ) -> Result<(), OracleError> {
        debug!(id = %req.id, "dispatching op {:#04x}", req.op);
        match req.op {
            GET => self.get(framed, &req).await,
            CHANGE => self.change(framed, &req).await,
            CHANGE_DKG => self.change_dkg(framed, &req).await,
            DELETE => self.delete(framed, &req).await,
            COMMIT => self.rotate(framed, &req, Rotation::Commit).await,
            UNDO => self.rotate(framed, &req, Rotation::Undo).await,
            READ => self.read_blob(framed, &req).await,
            other => {
                debug!("unknown dispatched opcode {other:#04x}");
                Err(OracleError::MalformedFraming)
            }
        }
    }

    // ── CREATE / CREATE_DKG (not rate-limited: no account exists yet) ────────

    async fn create<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
    ) -> Result<(), OracleError> {
        let id = AccountId::from_bytes(framed.read_array::<32>().await?);
        let alpha = framed.read_array::<32>().await?;
        if self.store.account_exists(&id) {
            return Err(OracleError::DuplicateAccount(id.to_hex()));
        }

        let k = oprf::random_key();
        let beta = oprf::evaluate(&k[..], &alpha)?;
        framed.send(&beta).await?;

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key[1..].copy_from_slice(&k[..]);
        self.finish_enrolment(framed, &id, &key[..]).await
    }

    async fn create_dkg<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
    ) -> Result<(), OracleError> {
        let header = framed.read_array::<3>().await?;
        let (index, t, n) = (header[0], header[1], header[2]);
        let id = AccountId::from_bytes(framed.read_array::<32>().await?);
        let alpha = framed.read_array::<32>().await?;
        if self.store.account_exists(&id) {
            return Err(OracleError::DuplicateAccount(id.to_hex()));
        }

        let mut aux = Vec::with_capacity(33);
        aux.push(CREATE_DKG);
        aux.extend_from_slice(&alpha);
        let xi = dkg::run(framed, &self.dkg, n, t, index, &aux).await?;

        let beta = oprf::evaluate(&xi[1..], &alpha)?;
        let mut resp = Vec::with_capacity(33);
        resp.push(xi[0]);
        resp.extend_from_slice(&beta);
        framed.send(&resp).await?;

        self.finish_enrolment(framed, &id, &xi[..]).await
    }

    /// Common tail of both create flows: receive and verify the signed
    /// `pub ‖ rules` message, run the host-blob update, then persist the
    /// account triple.
    async fn finish_enrolment<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        id: &AccountId,
        key: &[u8],
    ) -> Result<(), OracleError> {
        let msg = framed.read_exact(PUB_SIZE + RULE_SIZE + SIG_SIZE).await?;
        let pk: [u8; 32] = msg[..PUB_SIZE].try_into().expect("read_exact length");
        let body = sign::verify_blob(&msg, &pk)?;
        let rules = body[PUB_SIZE..].to_vec();

        hostblob::update_blob(framed, &self.store).await?;

        self.store.create_account_dir(id)?;
        self.store.save(id, "key", key)?;
        self.store.save(id, "pub", &pk)?;
        self.store.save(id, "rules", &rules)?;
        framed.send(OK_MARKER).await
    }

    // ── GET ──────────────────────────────────────────────────────────────────

    async fn get<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        req: &Request,
    ) -> Result<(), OracleError> {
        let alpha = req_alpha(req)?;
        // TODO: answer unknown ids with a dummy evaluation so account
        // existence is not observable through this path.
        let key = Zeroizing::new(
            self.store
                .load(&req.id, "key", Some(KEY_SIZE))?
                .ok_or_else(|| OracleError::UnknownAccount(req.id.to_hex()))?,
        );
        let rules = self
            .store
            .load(&req.id, "rules", Some(RULE_SIZE))?
            .ok_or_else(|| OracleError::UnknownAccount(req.id.to_hex()))?;

        let beta = oprf::evaluate(&key[1..], alpha)?;
        let mut resp = Vec::with_capacity(1 + beta.len() + rules.len());
        resp.push(key[0]);
        resp.extend_from_slice(&beta);
        resp.extend_from_slice(&rules);
        framed.send(&resp).await
    }

    // ── CHANGE / CHANGE_DKG ──────────────────────────────────────────────────

    async fn change<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        req: &Request,
    ) -> Result<(), OracleError> {
        let alpha = req_alpha(req)?;
        self.require_account(&req.id)?;
        self.auth(framed, &req.id, Some(alpha)).await?;

        // Fresh blinded element for the replacement key.
        let alpha_new = framed.read_array::<32>().await?;
        let k = oprf::random_key();
        let beta = oprf::evaluate(&k[..], &alpha_new)?;
        framed.send(&beta).await?;

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key[1..].copy_from_slice(&k[..]);
        self.stage_shadow(framed, &req.id, &key[..]).await
    }

    async fn change_dkg<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        req: &Request,
    ) -> Result<(), OracleError> {
        let alpha = req_alpha(req)?;
        self.require_account(&req.id)?;
        self.auth(framed, &req.id, Some(alpha)).await?;

        // The transcript binds the *original* rate-limited request; the
        // evaluation below uses the fresh blinded element.
        let mut aux = Vec::with_capacity(33);
        aux.push(CHANGE_DKG);
        aux.extend_from_slice(alpha);

        let msg = framed.read_array::<35>().await?;
        let (t, n, index) = (msg[0], msg[1], msg[2]);
        let alpha_new: [u8; 32] = msg[3..].try_into().expect("35-byte message");

        let xi = dkg::run(framed, &self.dkg, n, t, index, &aux).await?;

        let beta = oprf::evaluate(&xi[1..], &alpha_new)?;
        let mut resp = Vec::with_capacity(33);
        resp.push(xi[0]);
        resp.extend_from_slice(&beta);
        framed.send(&resp).await?;

        self.stage_shadow(framed, &req.id, &xi[..]).await
    }

    /// Common tail of both change flows: receive the signed replacement
    /// `pub ‖ rules`, stage the shadow triple.
    async fn stage_shadow<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        id: &AccountId,
        key: &[u8],
    ) -> Result<(), OracleError> {
        let msg = framed.read_exact(PUB_SIZE + RULE_SIZE + SIG_SIZE).await?;
        let pk: [u8; 32] = msg[..PUB_SIZE].try_into().expect("read_exact length");
        let body = sign::verify_blob(&msg, &pk)?;
        let rules = body[PUB_SIZE..].to_vec();

        let _lock = self.store.lock_account(id)?;
        self.store.save(id, "new", key)?;
        self.store.save(id, "rules.new", &rules)?;
        self.store.save(id, "pub.new", &pk)?;
        framed.send(OK_MARKER).await
    }

    // ── COMMIT / UNDO ────────────────────────────────────────────────────────

    async fn rotate<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        req: &Request,
        rotation: Rotation,
    ) -> Result<(), OracleError> {
        let alpha = req_alpha(req)?;
        self.require_account(&req.id)?;
        self.auth(framed, &req.id, Some(alpha)).await?;

        let _lock = self.store.lock_account(&req.id)?;
        let id = &req.id;
        let staged = rotation.staged();
        let preserved = rotation.preserved();

        let missing = |name: &str| OracleError::MissingShadow(format!("{id}: {name}"));
        let staged_key = Zeroizing::new(
            self.store.load(id, staged, Some(KEY_SIZE))?.ok_or_else(|| missing(staged))?,
        );
        let staged_rules = self
            .store
            .load(id, &format!("rules.{staged}"), Some(RULE_SIZE))?
            .ok_or_else(|| missing("rules"))?;
        let staged_pub = self
            .store
            .load(id, &format!("pub.{staged}"), Some(PUB_SIZE))?
            .ok_or_else(|| missing("pub"))?;

        let corrupt = |name: &str| {
            OracleError::StorageCorruption(format!("{id}: live {name} record missing"))
        };
        let live_key = Zeroizing::new(
            self.store.load(id, "key", Some(KEY_SIZE))?.ok_or_else(|| corrupt("key"))?,
        );
        let live_rules = self
            .store
            .load(id, "rules", Some(RULE_SIZE))?
            .ok_or_else(|| corrupt("rules"))?;
        let live_pub =
            self.store.load(id, "pub", Some(PUB_SIZE))?.ok_or_else(|| corrupt("pub"))?;

        // Preserve the live triple first, then promote; a crash in between
        // leaves both triples readable.
        self.store.save(id, preserved, &live_key)?;
        self.store.save(id, &format!("rules.{preserved}"), &live_rules)?;
        self.store.save(id, &format!("pub.{preserved}"), &live_pub)?;

        self.store.save(id, "key", &staged_key)?;
        self.store.save(id, "rules", &staged_rules)?;
        self.store.save(id, "pub", &staged_pub)?;

        self.store.unlink(id, staged)?;
        self.store.unlink(id, &format!("rules.{staged}"))?;
        self.store.unlink(id, &format!("pub.{staged}"))?;

        framed.send(OK_MARKER).await
    }

    // ── DELETE ───────────────────────────────────────────────────────────────

    async fn delete<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        req: &Request,
    ) -> Result<(), OracleError> {
        let alpha = req_alpha(req)?;
        self.require_account(&req.id)?;
        self.auth(framed, &req.id, Some(alpha)).await?;

        // Retract the host-record entry before the account vanishes.
        hostblob::update_blob(framed, &self.store).await?;

        {
            let _lock = self.store.lock_account(&req.id)?;
            self.store.remove_account(&req.id)?;
        }
        framed.send(OK_MARKER).await
    }

    // ── READ ─────────────────────────────────────────────────────────────────

    async fn read_blob<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        req: &Request,
    ) -> Result<(), OracleError> {
        // READ carries no blinded element, so the handshake sends only the
        // nonce and the client proves key ownership by signature alone.
        self.auth(framed, &req.id, None).await?;

        let blob = self.store.load(&req.id, "blob", None)?.unwrap_or_default();
        framed.send(&blob).await
    }

    // ── Per-op authentication handshake ──────────────────────────────────────

    async fn auth<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<S>,
        id: &AccountId,
        alpha: Option<&[u8; 32]>,
    ) -> Result<(), OracleError> {
        let pk: [u8; 32] = self
            .store
            .load(id, "pub", Some(PUB_SIZE))?
            .ok_or_else(|| OracleError::UnknownAccount(id.to_hex()))?
            .try_into()
            .expect("size checked by load");

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let mut msg = Vec::with_capacity(1 + 32 + NONCE_SIZE);
        if let Some(alpha) = alpha {
            if let Some(key) = self.store.load(id, "key", Some(KEY_SIZE))? {
                let key = Zeroizing::new(key);
                msg.push(key[0]);
                msg.extend_from_slice(&oprf::evaluate(&key[1..], alpha)?);
            }
        }
        msg.extend_from_slice(&nonce);
        framed.send(&msg).await?;

        let sig = framed.read_array::<SIG_SIZE>().await?;
        sign::verify_detached(&nonce, &sig, &pk)?;
        framed.send(AUTH_MARKER).await
    }

    fn require_account(&self, id: &AccountId) -> Result<(), OracleError> {
        if !self.store.account_exists(id) {
            return Err(OracleError::UnknownAccount(id.to_hex()));
        }
        Ok(())
    }
}

fn req_alpha(req: &Request) -> Result<&[u8; 32], OracleError> {
    req.alpha.as_ref().ok_or(OracleError::MalformedFraming)
}
