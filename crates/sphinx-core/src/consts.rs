//! ─── SPHINX Oracle Protocol Constants ───────────────────────────────────────
//!
//! Single-byte opcodes, fixed message sizes and the adaptive proof-of-work
//! difficulty ladder. The opcode values are shared with every client and
//! peer oracle; changing any of them is a wire-protocol break.

// ── Opcodes ──────────────────────────────────────────────────────────────────

pub const CREATE: u8 = 0x00;
pub const READ: u8 = 0x33;
pub const UNDO: u8 = 0x55;
pub const GET: u8 = 0x66;
pub const COMMIT: u8 = 0x99;
pub const CHANGE: u8 = 0xaa;
pub const DELETE: u8 = 0xff;
pub const CREATE_DKG: u8 = 0xf0;
pub const CHANGE_DKG: u8 = 0xf1;
pub const CHALLENGE_CREATE: u8 = 0x5a;
pub const CHALLENGE_VERIFY: u8 = 0xa5;

// ── Wire markers ─────────────────────────────────────────────────────────────

/// Sent on any fatal condition, immediately before closing the connection.
pub const FAIL_MARKER: &[u8] = b"\x00\x04fail";

/// Sent after a successful per-op authentication handshake.
pub const AUTH_MARKER: &[u8] = b"\x00\x04auth";

/// Sent on successful completion of a mutating operation.
pub const OK_MARKER: &[u8] = b"ok";

// ── Sizes ────────────────────────────────────────────────────────────────────

/// Opaque site-policy blob length. Externally visible only as the exact
/// length of the `pub ‖ rules ‖ sig` message.
pub const RULE_SIZE: usize = 79;

/// Stored OPRF key: 1-byte share index ‖ 32-byte scalar. Index 0 marks a
/// centrally generated (non-DKG) key.
pub const KEY_SIZE: usize = 33;

pub const ID_SIZE: usize = 32;
pub const ALPHA_SIZE: usize = 32;
pub const PUB_SIZE: usize = 32;
pub const SIG_SIZE: usize = 64;
pub const NONCE_SIZE: usize = 32;
pub const MAC_KEY_SIZE: usize = 32;
pub const MAC_SIZE: usize = 32;

/// `n[1] ‖ k[1] ‖ ts[8]`. The MAC covers exactly these ten bytes together
/// with the request.
pub const CHALLENGE_SIZE: usize = 10;

/// `level[1] ‖ count[4] ‖ ts[4]`, integers little-endian.
pub const DIFFICULTY_SIZE: usize = 9;

// ── Difficulty ladder ────────────────────────────────────────────────────────

/// One rung of the adaptive Equihash ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Difficulty {
    pub n: u8,
    pub k: u8,
    /// Maximum age of a valid solution in seconds (before the grace period).
    pub timeout: u64,
}

/// The ladder, easiest first. Timeouts were benchmarked on a Raspberry Pi 1B;
/// the upper rungs are interpolated.
pub const DIFFICULTIES: &[Difficulty] = &[
    Difficulty { n: 60, k: 4, timeout: 1 },     // 320KiB, ~0.02s
    Difficulty { n: 65, k: 4, timeout: 2 },     // 640KiB, ~0.04s
    Difficulty { n: 70, k: 4, timeout: 4 },     // 1MiB, ~0.08s
    Difficulty { n: 75, k: 4, timeout: 9 },     // 2MiB, ~0.2s
    Difficulty { n: 80, k: 4, timeout: 16 },    // 5MiB, ~0.5s
    Difficulty { n: 85, k: 4, timeout: 32 },    // 10MiB, ~0.9s
    Difficulty { n: 90, k: 4, timeout: 80 },    // 20MiB, ~2.4s
    Difficulty { n: 95, k: 4, timeout: 160 },   // 40MiB, ~4.6s
    Difficulty { n: 100, k: 4, timeout: 320 },  // 80MiB, ~7.8s
    Difficulty { n: 105, k: 4, timeout: 640 },  // 160MiB, ~25s
    Difficulty { n: 110, k: 4, timeout: 1280 }, // 320MiB, ~57s
    Difficulty { n: 115, k: 4, timeout: 2560 }, // 640MiB, ~70s
    Difficulty { n: 120, k: 4, timeout: 5120 }, // 1GiB, ~109s
];

/// Look up the solution timeout for Equihash parameters handed back by a
/// client. `None` means the pair was never issued by this ladder.
pub fn ladder_timeout(n: u8, k: u8) -> Option<u64> {
    DIFFICULTIES
        .iter()
        .find(|d| d.n == n && d.k == k)
        .map(|d| d.timeout)
}

// ── Configuration defaults ───────────────────────────────────────────────────

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2355;
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_MAX_KIDS: usize = 5;
pub const DEFAULT_DATADIR: &str = "/var/lib/sphinx";
pub const DEFAULT_RL_DECAY_SECS: u64 = 1800;
pub const DEFAULT_RL_THRESHOLD: u32 = 1;
pub const DEFAULT_RL_GRACETIME_SECS: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_monotone() {
        for w in DIFFICULTIES.windows(2) {
            assert!(w[0].n < w[1].n, "n must strictly increase");
            assert!(w[0].timeout < w[1].timeout, "timeout must strictly increase");
        }
    }

    #[test]
    fn ladder_lookup() {
        assert_eq!(ladder_timeout(60, 4), Some(1));
        assert_eq!(ladder_timeout(120, 4), Some(5120));
        assert_eq!(ladder_timeout(61, 4), None);
        assert_eq!(ladder_timeout(60, 5), None);
    }
}
