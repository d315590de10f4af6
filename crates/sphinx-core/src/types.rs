use std::fmt;

// ── AccountId ────────────────────────────────────────────────────────────────

/// 32-byte opaque account identifier. The client derives it; the server only
/// ever hex-encodes it as a directory name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    /// Parse from a wire slice; fails on anything but exactly 32 bytes.
    pub fn from_slice(b: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = b.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded form, used as the on-disk directory name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({}…)", &self.to_hex()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dir_name() {
        let id = AccountId::from_bytes([0xab; 32]);
        assert_eq!(id.to_hex().len(), 64);
        assert!(id.to_hex().chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn from_slice_rejects_bad_lengths() {
        assert!(AccountId::from_slice(&[0u8; 31]).is_none());
        assert!(AccountId::from_slice(&[0u8; 33]).is_none());
        assert!(AccountId::from_slice(&[0u8; 32]).is_some());
    }
}
