//! Durable per-account record store.
//!
//! One directory per account (hex-encoded id), one file per record. The
//! store never interprets record contents; it only enforces sizes the
//! caller asks for, unix permissions (0600 files under 0700 directories)
//! and write atomicity: every save goes write-temp → fsync → rename →
//! fsync(parent), so a crash leaves either the old or the new record.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use sphinx_core::{AccountId, OracleError, MAC_KEY_SIZE};

pub struct RecordStore {
    datadir: PathBuf,
}

impl RecordStore {
    pub fn new<P: Into<PathBuf>>(datadir: P) -> Self {
        Self { datadir: datadir.into() }
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn account_dir(&self, id: &AccountId) -> PathBuf {
        self.datadir.join(id.to_hex())
    }

    pub fn account_exists(&self, id: &AccountId) -> bool {
        self.account_dir(id).exists()
    }

    /// Create the data directory if missing, mode 0700. Idempotent.
    pub fn ensure_datadir(&self) -> Result<(), OracleError> {
        match fs::DirBuilder::new().recursive(true).mode(0o700).create(&self.datadir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the account directory, mode 0700. Fails if it already exists;
    /// this is the create-path uniqueness check.
    pub fn create_account_dir(&self, id: &AccountId) -> Result<(), OracleError> {
        self.ensure_datadir()?;
        match fs::DirBuilder::new().mode(0o700).create(self.account_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(OracleError::DuplicateAccount(id.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the account directory and everything in it.
    pub fn remove_account(&self, id: &AccountId) -> Result<(), OracleError> {
        fs::remove_dir_all(self.account_dir(id))?;
        Ok(())
    }

    // ── Records ──────────────────────────────────────────────────────────────

    /// Atomically write `data` to `<datadir>/<id>/<name>`, mode 0600.
    pub fn save(&self, id: &AccountId, name: &str, data: &[u8]) -> Result<(), OracleError> {
        let dir = self.account_dir(id);
        write_atomic(&dir, name, data)
    }

    /// Load `<datadir>/<id>/<name>`. Absent file is `None`; a present file
    /// whose size differs from `expected` is corruption.
    pub fn load(
        &self,
        id: &AccountId,
        name: &str,
        expected: Option<usize>,
    ) -> Result<Option<Vec<u8>>, OracleError> {
        let path = self.account_dir(id).join(name);
        load_checked(&path, expected)
    }

    pub fn unlink(&self, id: &AccountId, name: &str) -> Result<(), OracleError> {
        fs::remove_file(self.account_dir(id).join(name))?;
        Ok(())
    }

    // ── MAC key ──────────────────────────────────────────────────────────────

    /// Load the process-wide challenge MAC key, creating it on first use.
    ///
    /// Creation is open-exclusive; a loser of the create race re-reads the
    /// winner's key, so all workers agree on one key.
    pub fn load_or_create_mac_key(&self) -> Result<Zeroizing<[u8; MAC_KEY_SIZE]>, OracleError> {
        if let Some(key) = self.load_mac_key()? {
            return Ok(key);
        }
        self.ensure_datadir()?;
        let path = self.datadir.join("key");

        let mut key = Zeroizing::new([0u8; MAC_KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(&mut key[..]);
        match OpenOptions::new().write(true).create_new(true).mode(0o600).open(&path) {
            Ok(mut f) => {
                f.write_all(&key[..])?;
                f.sync_all()?;
                debug!("created challenge MAC key");
                Ok(key)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self
                .load_mac_key()?
                .ok_or_else(|| OracleError::StorageCorruption("mac key vanished".into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the MAC key without creating it.
    pub fn load_mac_key(&self) -> Result<Option<Zeroizing<[u8; MAC_KEY_SIZE]>>, OracleError> {
        let path = self.datadir.join("key");
        match load_checked(&path, Some(MAC_KEY_SIZE))? {
            Some(bytes) => {
                let mut key = Zeroizing::new([0u8; MAC_KEY_SIZE]);
                key.copy_from_slice(&bytes);
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    // ── Advisory lock ────────────────────────────────────────────────────────

    /// Take the exclusive per-account lock. Serializes mutating operations
    /// (change/commit/undo/delete and host-blob updates) against each other;
    /// the lock is released when the guard drops.
    pub fn lock_account(&self, id: &AccountId) -> Result<AccountLock, OracleError> {
        let path = self.account_dir(id).join("lock");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(AccountLock { _file: file })
    }
}

/// Guard for the exclusive per-account advisory lock.
pub struct AccountLock {
    _file: File,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<(), OracleError> {
    let tmp = dir.join(format!(".{name}.tmp"));
    let dest = dir.join(name);
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    fs::rename(&tmp, &dest)?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn load_checked(path: &Path, expected: Option<usize>) -> Result<Option<Vec<u8>>, OracleError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if let Some(size) = expected {
        if bytes.len() != size {
            return Err(OracleError::StorageCorruption(format!(
                "{} is {} bytes, expected {}",
                path.display(),
                bytes.len(),
                size
            )));
        }
    }
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn store() -> (tempfile::TempDir, RecordStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::new(tmp.path().join("data"));
        (tmp, store)
    }

    fn test_id(b: u8) -> AccountId {
        AccountId::from_bytes([b; 32])
    }

    #[test]
    fn save_load_round_trip() {
        let (_tmp, store) = store();
        let id = test_id(1);
        store.create_account_dir(&id).unwrap();
        store.save(&id, "rules", &[0xaa; 79]).unwrap();
        assert_eq!(store.load(&id, "rules", Some(79)).unwrap().unwrap(), vec![0xaa; 79]);
        assert!(store.load(&id, "missing", None).unwrap().is_none());
    }

    #[test]
    fn size_mismatch_is_corruption() {
        let (_tmp, store) = store();
        let id = test_id(2);
        store.create_account_dir(&id).unwrap();
        store.save(&id, "key", &[1; 10]).unwrap();
        assert!(matches!(
            store.load(&id, "key", Some(33)),
            Err(OracleError::StorageCorruption(_))
        ));
    }

    #[test]
    fn permissions_are_restrictive() {
        let (_tmp, store) = store();
        let id = test_id(3);
        store.create_account_dir(&id).unwrap();
        store.save(&id, "pub", &[0; 32]).unwrap();

        let dir_mode = fs::metadata(store.account_dir(&id)).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let data_mode = fs::metadata(store.datadir()).unwrap().permissions().mode();
        assert_eq!(data_mode & 0o777, 0o700);
        let file_mode =
            fs::metadata(store.account_dir(&id).join("pub")).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn duplicate_account_dir_fails() {
        let (_tmp, store) = store();
        let id = test_id(4);
        store.create_account_dir(&id).unwrap();
        assert!(matches!(
            store.create_account_dir(&id),
            Err(OracleError::DuplicateAccount(_))
        ));
    }

    #[test]
    fn remove_account_erases_everything() {
        let (_tmp, store) = store();
        let id = test_id(5);
        store.create_account_dir(&id).unwrap();
        store.save(&id, "key", &[0; 33]).unwrap();
        store.save(&id, "blob", b"host record").unwrap();
        store.remove_account(&id).unwrap();
        assert!(!store.account_exists(&id));
    }

    #[test]
    fn unlink_removes_single_record() {
        let (_tmp, store) = store();
        let id = test_id(6);
        store.create_account_dir(&id).unwrap();
        store.save(&id, "new", &[0; 33]).unwrap();
        store.unlink(&id, "new").unwrap();
        assert!(store.load(&id, "new", None).unwrap().is_none());
    }

    #[test]
    fn mac_key_is_created_once() {
        let (_tmp, store) = store();
        assert!(store.load_mac_key().unwrap().is_none());
        let first = store.load_or_create_mac_key().unwrap();
        let second = store.load_or_create_mac_key().unwrap();
        assert_eq!(&first[..], &second[..]);
        assert_eq!(&first[..], &store.load_mac_key().unwrap().unwrap()[..]);
    }

    #[test]
    fn account_lock_is_exclusive() {
        let (_tmp, store) = store();
        let id = test_id(7);
        store.create_account_dir(&id).unwrap();

        let guard = store.lock_account(&id).unwrap();
        let second = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(store.account_dir(&id).join("lock"))
            .unwrap();
        assert!(second.try_lock_exclusive().is_err());
        drop(guard);
        assert!(second.try_lock_exclusive().is_ok());
    }
}
