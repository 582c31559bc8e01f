//! NVMe/TCP target: listener and per-connection tasks

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, info_span, warn, Instrument};

use crate::config::TargetConfig;
use crate::connection::Connection;
use crate::error::NvmeOfResult;
use crate::namespace::{store_for, BlockStore, Namespace};

/// State shared by every connection of a target
#[derive(Debug)]
pub struct TargetContext {
    /// Target configuration
    pub config: TargetConfig,
    /// The exported namespace
    pub namespace: Namespace,
}

impl TargetContext {
    /// Context backed by the store selected in `config`
    pub fn new(config: TargetConfig) -> Self {
        let store = store_for(config.store, config.namespace.block_size);
        Self::with_store(config, store)
    }

    /// Context backed by a caller-provided store
    pub fn with_store(config: TargetConfig, store: Arc<dyn BlockStore>) -> Self {
        let namespace = Namespace::new(&config.namespace, store);
        Self { config, namespace }
    }
}

/// NVMe/TCP target
pub struct NvmeTcpTarget {
    ctx: Arc<TargetContext>,
    next_conn_id: AtomicU64,
}

impl NvmeTcpTarget {
    /// Create a target after validating `config`
    pub fn new(config: TargetConfig) -> NvmeOfResult<Self> {
        config.validate()?;
        Ok(Self::from_context(TargetContext::new(config)))
    }

    /// Create a target over a caller-provided store
    pub fn with_store(config: TargetConfig, store: Arc<dyn BlockStore>) -> NvmeOfResult<Self> {
        config.validate()?;
        Ok(Self::from_context(TargetContext::with_store(config, store)))
    }

    fn from_context(ctx: TargetContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Shared context
    pub fn context(&self) -> &Arc<TargetContext> {
        &self.ctx
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> NvmeOfResult<TcpListener> {
        let addr = self.ctx.config.listen_addr();
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            subnqn = %self.ctx.config.subsystem_nqn,
            "NVMe/TCP target listening"
        );
        Ok(listener)
    }

    /// Bind and serve forever
    pub async fn run(&self) -> NvmeOfResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` forever
    pub async fn serve(&self, listener: TcpListener) -> NvmeOfResult<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve connections from `listener` until `shutdown` resolves
    ///
    /// Connections already running keep going on their own tasks.
    pub async fn serve_with_shutdown<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> NvmeOfResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("NVMe/TCP target stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if self.ctx.config.tcp.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(conn = id, error = %e, "failed to set TCP_NODELAY");
            }
        }

        let ctx = Arc::clone(&self.ctx);
        let span = info_span!("connection", conn = id, %peer);
        tokio::spawn(
            async move {
                info!("connection accepted");
                match Connection::new(id, stream, ctx).run().await {
                    Ok(()) => info!("connection closed"),
                    Err(e) => warn!(error = %e, "connection failed"),
                }
            }
            .instrument(span),
        );
    }
}

impl std::fmt::Debug for NvmeTcpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeTcpTarget")
            .field("listen_addr", &self.ctx.config.listen_addr())
            .field("subsystem_nqn", &self.ctx.config.subsystem_nqn)
            .field("connections", &self.next_conn_id.load(Ordering::Relaxed))
            .finish()
    }
}
