use thiserror::Error;

/// Every variant is fatal for the connection that raised it: the worker
/// answers with the fail marker and exits. Nothing here is ever serialized
/// onto the wire; an oblivious server must not leak why a request died.
#[derive(Debug, Error)]
pub enum OracleError {
    // ── Wire ─────────────────────────────────────────────────────────────────
    #[error("malformed message framing")]
    MalformedFraming,

    #[error("wrong length: expected {expected}, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("invalid signature")]
    BadSignature,

    // ── Account state ────────────────────────────────────────────────────────
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("account already exists: {0}")]
    DuplicateAccount(String),

    #[error("no staged update for account: {0}")]
    MissingShadow(String),

    // ── Rate limiter ─────────────────────────────────────────────────────────
    #[error("challenge is too old")]
    StaleChallenge,

    #[error("challenge MAC mismatch")]
    BadMac,

    #[error("invalid proof-of-work solution")]
    BadSolution,

    // ── Crypto ───────────────────────────────────────────────────────────────
    #[error("OPRF evaluation failed")]
    OprfEval,

    #[error("peer authentication failed: {0}")]
    PeerAuth(String),

    // ── Environment ──────────────────────────────────────────────────────────
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted record: {0}")]
    StorageCorruption(String),
}
