//! Worker server (C7): listens for TCP connections and serves
//! `TRAIN_MODEL`/`SEND_DATASET`/`RECV_DATASET` requests against the shared
//! data cache and factory registry.
//!
//! Grounded on `examples/original_source/net.c`'s `start_server`/
//! `process_request_*` family for the connection-header-then-dispatch
//! protocol shape, and the teacher's accept-then-`tokio::spawn`-per-connection
//! idiom in
//! `examples/StractOrg-stract/crates/core/src/distributed/sonic/service.rs`
//! (`Server::accept` spawning a task per request against a cloned `Arc<S>`).

pub mod pool;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use crate::cache::DataCache;
use crate::config::Config;
use crate::dataset::Hash;
use crate::error::Error;
use crate::factory::FactoryRegistry;
use crate::protocol::{
    read_connection_header, read_fetch_decision, read_recv_dataset_payload,
    read_recv_dataset_request, read_send_dataset_request, read_train_model_request,
    send_send_dataset_request, write_connection_header, write_data_follows,
    write_recv_dataset_duplicate, write_recv_dataset_final, write_recv_dataset_go_ahead,
    write_send_dataset_response, write_send_dataset_unknown, write_train_model_result,
    write_train_model_unknown_dataset, write_train_model_unknown_factory, ConnectionHeader,
    FetchDecision, RecvDatasetPayload, RequestKind,
};

pub use pool::{PoolSlot, TrainOutcome, WorkerPool};

/// The shared state every accepted connection is handled against. Cheap to
/// clone (everything inside is an `Arc`/`DataCache` handle), the same way
/// the teacher's `sonic::service::Server` clones an `Arc<S>` per accept.
#[derive(Clone)]
pub struct WorkerServer {
    config: Arc<Config>,
    cache: DataCache,
    factories: Arc<FactoryRegistry>,
    pool: WorkerPool,
    exe: PathBuf,
}

impl WorkerServer {
    pub fn new(config: Arc<Config>, cache: DataCache, factories: FactoryRegistry) -> Result<Self, Error> {
        let pool = WorkerPool::new(config.number_of_remote_workers);
        let exe = std::env::current_exe()?;
        Ok(Self {
            config,
            cache,
            factories: Arc::new(factories),
            pool,
            exe,
        })
    }

    /// Overrides the executable re-invoked for `TRAIN_MODEL` isolation.
    /// Only needed by tests, where `current_exe()` is the test harness
    /// binary rather than the real `crucible` CLI.
    pub fn with_exe(mut self, exe: PathBuf) -> Self {
        self.exe = exe;
        self
    }

    pub async fn bind(self, addr: impl ToSocketAddrs) -> Result<BoundWorker, Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(BoundWorker {
            listener,
            server: self,
        })
    }

    /// Bounds a read by `remote_read_timeout` (§5: "Read timeout
    /// `remote_read_timeout` on every socket reader"), matching the
    /// original's every reader going through
    /// `filereader_with_timeout_new(sock, config_remote_read_timeout)`.
    async fn read_with_timeout<F, T>(&self, read: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::time::timeout(self.config.remote_read_timeout(), read)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// A `WorkerServer` with its listening socket already open, so tests and the
/// CLI can read back the bound address before serving forever.
pub struct BoundWorker {
    listener: TcpListener,
    server: WorkerServer,
}

impl BoundWorker {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, handling each on its own task (§4.5: the
    /// idiomatic substitute for the original's one-process-per-connection
    /// model).
    pub async fn serve(self) -> Result<(), Error> {
        info!(addr = %self.listener.local_addr()?, "worker listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let server = self.server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!(%peer, error = %e, "connection failed");
                }
            });
        }
    }
}

impl WorkerServer {
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), Error> {
        // The `free -> reserved` transition happens before the header is
        // written, in the same way the original decides `accept_request`
        // and `fork()`s inside one signal-blocked critical section: there is
        // no gap in which two connections could both believe they got the
        // last slot (§4.6).
        let slot = self.pool.reserve();
        let header = ConnectionHeader {
            accept: slot.is_some(),
            num_jobs: self.pool.num_running().min(u8::MAX as usize) as u8,
            num_workers: self.pool.max_workers().min(u8::MAX as usize) as u8,
        };
        write_connection_header(&mut stream, header).await?;
        let slot = match slot {
            Some(slot) => slot,
            None => return Ok(()),
        };

        let kind = RequestKind::from_byte(
            self.read_with_timeout(async { Ok(stream.read_u8().await?) }).await?,
        )?;
        match kind {
            RequestKind::TrainModel => self.handle_train_model(&mut stream, slot).await,
            RequestKind::SendDataset => {
                // SEND_DATASET/RECV_DATASET aren't process-isolated (§4.6,
                // DESIGN.md), so the slot this connection booked is released
                // immediately instead of being carried through a child's
                // lifetime.
                drop(slot);
                self.handle_send_dataset(&mut stream).await
            }
            RequestKind::RecvDataset => {
                drop(slot);
                self.handle_recv_dataset(&mut stream).await
            }
        }
    }

    async fn handle_train_model(&self, stream: &mut TcpStream, slot: PoolSlot) -> Result<(), Error> {
        let (hash, factory_name, transforms) = self
            .read_with_timeout(read_train_model_request(stream))
            .await?;

        let dataset = match self.cache.get(&hash) {
            Some(dataset) => dataset,
            None => return write_train_model_unknown_dataset(stream).await,
        };

        if self.factories.resolve(&factory_name).is_err() {
            return write_train_model_unknown_factory(stream).await;
        }

        let outcome = pool::run_training_job(
            slot,
            &self.exe,
            &dataset,
            &factory_name,
            &transforms,
            self.config.remote_worker_timeout(),
        )
        .await?;

        write_train_model_result(stream, outcome.cpu_time_ms, outcome.score).await?;

        match self.read_with_timeout(read_fetch_decision(stream)).await? {
            FetchDecision::SendCode => write_data_follows(stream, &outcome.node).await?,
            FetchDecision::DiscardCode => {}
        }
        Ok(())
    }

    async fn handle_send_dataset(&self, stream: &mut TcpStream) -> Result<(), Error> {
        let hash = self.read_with_timeout(read_send_dataset_request(stream)).await?;
        match self.cache.get(&hash) {
            Some(dataset) => write_send_dataset_response(stream, &dataset).await,
            None => write_send_dataset_unknown(stream).await,
        }
    }

    async fn handle_recv_dataset(&self, stream: &mut TcpStream) -> Result<(), Error> {
        let hash = self.read_with_timeout(read_recv_dataset_request(stream)).await?;
        if self.cache.contains(&hash) {
            return write_recv_dataset_duplicate(stream, &hash).await;
        }
        write_recv_dataset_go_ahead(stream).await?;

        let received = match self.read_with_timeout(read_recv_dataset_payload(stream)).await? {
            RecvDatasetPayload::Inline(dataset) => Some(dataset),
            RecvDatasetPayload::FromPeer { host, port } => {
                self.pull_from_peer(&host, port, &hash).await.unwrap_or(None)
            }
        };

        // §4.5/§7: the server recomputes the received dataset's own hash and
        // checks it against the hash the client announced up front; a
        // mismatch is an integrity failure, not a transient one, so the
        // dataset is discarded rather than cached under the wrong key.
        let ok = match received {
            Some(dataset) if dataset.hash == hash => {
                self.cache.insert(dataset);
                true
            }
            Some(_) => {
                warn!(hash = %hex(&hash), "recv_dataset hash mismatch, discarding");
                false
            }
            None => false,
        };
        write_recv_dataset_final(stream, &hash, ok).await
    }

    /// Peer-to-peer pull: connect to the server that already has the
    /// dataset and issue it a `SEND_DATASET` request, mirroring the
    /// original's `distribute_dataset` propagate phase from the receiving
    /// end.
    async fn pull_from_peer(
        &self,
        host: &str,
        port: u16,
        hash: &Hash,
    ) -> Result<Option<crate::dataset::Dataset>, Error> {
        let addr = format!("{host}:{port}");
        let mut peer = tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        let header = self.read_with_timeout(read_connection_header(&mut peer)).await?;
        if !header.accept {
            return Ok(None);
        }

        send_send_dataset_request(&mut peer, hash).await?;
        self.read_with_timeout(crate::protocol::read_send_dataset_response(&mut peer))
            .await
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
