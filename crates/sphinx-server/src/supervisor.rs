//! Accept loop and per-connection workers.
//!
//! One spawned task per connection, hard-bounded at `max_kids`; the accept
//! loop blocks on a semaphore permit when the bound is reached. A panic in
//! a worker is contained by the task boundary and cannot corrupt another
//! connection's state; cross-worker coordination happens only through the
//! record store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use sphinx_store::RecordStore;

use crate::config::Config;
use crate::dkg::DkgConfig;
use crate::protocol::Oracle;
use crate::ratelimit::RateLimitParams;
use crate::tls;
use crate::wire::Framed;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let acceptor = tls::acceptor(&config.ssl_cert, &config.ssl_key)?;
    let addr = SocketAddr::new(config.address, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "oracle listening");

    let oracle = Arc::new(Oracle {
        store: RecordStore::new(config.datadir.clone()),
        rl: RateLimitParams {
            decay: config.rl_decay,
            threshold: config.rl_threshold,
            gracetime: config.rl_gracetime,
        },
        dkg: DkgConfig {
            noisekey: config.noisekey.clone(),
            authorized_keys: config.authorized_keys.clone(),
        },
    });
    let io_timeout = Duration::from_secs(config.timeout);
    let workers = Arc::new(Semaphore::new(config.max_kids));

    loop {
        // At capacity this waits until a worker finishes.
        let permit = Arc::clone(&workers)
            .acquire_owned()
            .await
            .expect("worker semaphore is never closed");
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "connection accepted");

        let acceptor = acceptor.clone();
        let oracle = Arc::clone(&oracle);
        tokio::spawn(async move {
            let _permit = permit;
            let tls_stream =
                match tokio::time::timeout(io_timeout, acceptor.accept(socket)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!(%peer, error = %e, "tls handshake failed");
                        return;
                    }
                    Err(_) => {
                        warn!(%peer, "tls handshake timed out");
                        return;
                    }
                };

            let mut framed = Framed::new(tls_stream, io_timeout);
            match oracle.handle(&mut framed).await {
                Ok(()) => {
                    debug!(%peer, "connection done");
                    framed.shutdown().await;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "connection failed");
                    framed.send_fail().await;
                }
            }
        });
    }
}
