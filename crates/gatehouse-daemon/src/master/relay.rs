//! Public gateway relay.
//!
//! The master holds the public gateway sockets so they can be handed to
//! a successor without dropping connections; the workers hold the data
//! planes on loopback ports. This relay bridges the two: every accepted
//! gateway connection is proxied byte-for-byte to a healthy worker
//! picked round-robin. Connections that arrive while no worker is
//! healthy are dropped, not queued.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use gatehouse_core::traffic::TrafficRegistry;

use super::workers::WorkerPool;

/// Accept loop over the gateway listener pool.
pub struct GatewayRelay {
    registry: TrafficRegistry,
    pool: Arc<WorkerPool>,
}

impl GatewayRelay {
    /// Builds the relay over the gateway pool.
    #[must_use]
    pub fn new(registry: TrafficRegistry, pool: Arc<WorkerPool>) -> Self {
        Self { registry, pool }
    }

    /// Accepts and proxies gateway connections until shutdown flips.
    /// In-flight proxied connections are not interrupted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                (client, peer) = super::accept_from(&self.registry) => {
                    let Some(backend) = self.pool.pick_backend().await else {
                        warn!(%peer, "no healthy worker for gateway connection, dropping");
                        continue;
                    };
                    tokio::spawn(async move {
                        if let Err(err) = relay_connection(client, backend).await {
                            debug!(%peer, %backend, error = %err, "gateway connection ended with error");
                        }
                    });
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
            }
        }
    }
}

async fn relay_connection(mut client: TcpStream, backend: SocketAddr) -> std::io::Result<()> {
    let mut upstream = TcpStream::connect(backend).await?;
    copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use gatehouse_core::config::NodeConfig;
    use gatehouse_core::push::{
        DeleteRequest, DeleteResponse, HelloRequest, HelloResponse, PushError, RefreshRequest,
        RefreshResponse, SetRequest, SetResponse,
    };

    use super::super::workers::PushClient;
    use super::*;

    /// Answers pings with the worker's assigned ports so reconcile sees
    /// no drift.
    struct EchoPortsClient {
        ports: HashMap<u32, Vec<u32>>,
    }

    fn worker_id(socket: &Path) -> u32 {
        socket
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.rsplit('-').next())
            .and_then(|id| id.parse().ok())
            .unwrap()
    }

    #[async_trait]
    impl PushClient for EchoPortsClient {
        async fn ping(
            &self,
            socket: &Path,
            request: HelloRequest,
        ) -> Result<HelloResponse, PushError> {
            let id = worker_id(socket);
            Ok(HelloResponse::echo(
                &request,
                self.ports.get(&id).cloned().unwrap_or_default(),
            ))
        }

        async fn set_check(
            &self,
            _socket: &Path,
            _request: SetRequest,
        ) -> Result<SetResponse, PushError> {
            Ok(SetResponse::success(Vec::new()))
        }

        async fn set(
            &self,
            _socket: &Path,
            _request: SetRequest,
        ) -> Result<SetResponse, PushError> {
            Ok(SetResponse::success(Vec::new()))
        }

        async fn delete_check(
            &self,
            _socket: &Path,
            _request: DeleteRequest,
        ) -> Result<DeleteResponse, PushError> {
            Ok(DeleteResponse::success(Vec::new()))
        }

        async fn delete(
            &self,
            _socket: &Path,
            _request: DeleteRequest,
        ) -> Result<DeleteResponse, PushError> {
            Ok(DeleteResponse::success(Vec::new()))
        }

        async fn refresh(
            &self,
            _socket: &Path,
            _request: RefreshRequest,
        ) -> Result<RefreshResponse, PushError> {
            Ok(RefreshResponse::success())
        }
    }

    fn pool_on_port(port: u16, dir: &tempfile::TempDir) -> Arc<WorkerPool> {
        let mut config = NodeConfig::default();
        config.workers.count = 1;
        config.workers.base_port = port;
        config.socket_dir = dir.path().to_path_buf();
        let client = Arc::new(EchoPortsClient {
            ports: HashMap::from([(0, vec![u32::from(port)])]),
        });
        Arc::new(WorkerPool::with_client(
            Arc::new(config),
            PathBuf::from("gatehouse.toml"),
            0,
            client,
        ))
    }

    #[tokio::test]
    async fn test_relay_bridges_gateway_to_worker() {
        // Echo server standing in for a worker data plane.
        let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = backend.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let pool = pool_on_port(backend_port, &dir);
        pool.reconcile().await;

        let gateway = TrafficRegistry::new();
        let listener = gateway.listen("tcp", "127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = GatewayRelay::new(gateway, pool);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move { relay.run(shutdown_rx).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping through the relay").await.unwrap();
        let mut echoed = [0u8; 22];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping through the relay");

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_drops_connection_when_no_worker_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        // Never reconciled, so the single worker is still Unknown.
        let pool = pool_on_port(18400, &dir);

        let gateway = TrafficRegistry::new();
        let listener = gateway.listen("tcp", "127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = GatewayRelay::new(gateway, pool);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move { relay.run(shutdown_rx).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        // The relay closes the connection without proxying anything.
        assert!(matches!(stream.read(&mut buf).await, Ok(0) | Err(_)));

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }
}
