//! Host-record blob protocol: a separately signed enrolment registry,
//! updated inline during create and delete, readable through READ.
//!
//! The blob file keeps its 2-byte big-endian length prefix exactly as
//! signed, so the stored bytes are what the signature covered.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use sphinx_core::{AccountId, OracleError, ID_SIZE, PUB_SIZE, SIG_SIZE};
use sphinx_crypto::sign;
use sphinx_store::RecordStore;

use crate::wire::Framed;

/// Run one host-blob append/update exchange.
///
/// An all-zero id means the client keeps no host record; the exchange is a
/// no-op. Otherwise the id either enrols (no authkey, no directory) or
/// updates under its existing authkey.
pub async fn update_blob<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    store: &RecordStore,
) -> Result<(), OracleError> {
    let signed_id = framed.read_exact(ID_SIZE + SIG_SIZE).await?;
    if signed_id[..ID_SIZE].iter().all(|&b| b == 0) {
        return Ok(());
    }
    let id = AccountId::from_slice(&signed_id[..ID_SIZE]).expect("read_exact length");

    match store.load(&id, "pub", Some(PUB_SIZE))? {
        None => {
            if store.account_exists(&id) {
                return Err(OracleError::StorageCorruption(format!(
                    "host record {id} has a directory but no authkey"
                )));
            }
            debug!(%id, "host record enrolment");
            enrol(framed, store, &id).await
        }
        Some(pk_bytes) => {
            let pk: [u8; 32] = pk_bytes.try_into().expect("size checked by load");
            sign::verify_blob(&signed_id, &pk)?;

            let blob = store.load(&id, "blob", None)?.ok_or_else(|| {
                OracleError::StorageCorruption(format!(
                    "host record {id} has an authkey but no blob"
                ))
            })?;

            // Hold the lock across send-current / receive-updated so two
            // updates cannot interleave their read-modify-write.
            let _lock = store.lock_account(&id)?;
            framed.send(&blob).await?;

            let updated = read_signed_blob(framed, &pk, &[]).await?;
            store.save(&id, "blob", &updated)
        }
    }
}

/// First contact: hand out the empty placeholder blob, then accept the
/// client's authkey and first signed blob.
async fn enrol<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    store: &RecordStore,
    id: &AccountId,
) -> Result<(), OracleError> {
    framed.send(b"\x00\x00").await?;

    let pk = framed.read_array::<PUB_SIZE>().await?;
    let blob = read_signed_blob(framed, &pk, &pk).await?;

    store.create_account_dir(id)?;
    store.save(id, "pub", &pk)?;
    store.save(id, "blob", &blob)
}

/// Read `prefix[2] ‖ blob ‖ sig[64]`; verify the detached signature over
/// `context ‖ prefix ‖ blob`; return the stored form `prefix ‖ blob`.
async fn read_signed_blob<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S>,
    pk: &[u8; 32],
    context: &[u8],
) -> Result<Vec<u8>, OracleError> {
    let prefix = framed.read_array::<2>().await?;
    let size = u16::from_be_bytes(prefix) as usize;
    let rest = framed.read_exact(size + SIG_SIZE).await?;

    let mut msg = Vec::with_capacity(context.len() + 2 + rest.len());
    msg.extend_from_slice(context);
    msg.extend_from_slice(&prefix);
    msg.extend_from_slice(&rest);

    let body = sign::verify_blob(&msg, pk)?;
    Ok(body[context.len()..].to_vec())
}
