//! Gateway server
//!
//! Owns the long-lived services (configuration store, rate limiter, token service)
//! and runs the accept loop:
//! - HTTP/1.1 connections served by hyper, one task per connection
//! - configuration hot reload through the store's watcher
//! - graceful shutdown on Ctrl+C / SIGTERM: connections drain for a bounded
//!   time, then remaining requests are cancelled

mod dispatch;
mod handler;

pub use dispatch::*;
pub use handler::*;

use crate::config::ConfigStore;
use crate::error::{GatewayError, Result};
use crate::observability::FileDebugSink;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Default time in-flight connections get to finish after a stop signal
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Time cancelled requests get to write their response before the server returns
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// The gateway server
pub struct Server {
    store: Arc<ConfigStore>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    drain: CancellationToken,
    requests: CancellationToken,
    connections: TaskTracker,
    drain_timeout: Duration,
    watch: bool,
}

impl Server {
    /// Create a server with the default dispatcher (tiktoken counter, file debug sink)
    pub fn new(store: Arc<ConfigStore>) -> Result<Self> {
        let reader = store.reader();
        let dispatcher = Dispatcher::new(reader.clone(), build_http_client()?)
            .with_debug_sink(Arc::new(FileDebugSink::new(reader)));
        Ok(Self::with_dispatcher(store, dispatcher))
    }

    /// Create a server around a prepared dispatcher
    ///
    /// Provider limits are registered now and again after every reload.
    pub fn with_dispatcher(store: Arc<ConfigStore>, dispatcher: Dispatcher) -> Self {
        let dispatcher = Arc::new(dispatcher);
        dispatcher.register_limits(&store.snapshot());

        let limiter = dispatcher.rate_limiter().clone();
        store.on_reload(Box::new(move |config| register_limits(&limiter, config)));

        Self {
            store,
            dispatcher,
            shutdown: CancellationToken::new(),
            drain: CancellationToken::new(),
            requests: CancellationToken::new(),
            connections: TaskTracker::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            watch: true,
        }
    }

    /// How long open connections may keep running once the server stops
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Enable or disable the configuration file watcher
    pub fn watch_config(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Cancelling this token stops the server as if a signal had arrived
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the address from the current snapshot
    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.store.snapshot().bind_address();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            GatewayError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind {}: {}", address, e),
            ))
        })?;
        Ok(listener)
    }

    /// Run until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, Self::wait_for_shutdown()).await
    }

    /// Serve connections from `listener` until `signal` completes
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr: SocketAddr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        let watcher = if self.watch {
            match self.store.clone().start_watcher() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("Configuration hot reload disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        tokio::pin!(signal);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        self.connections.spawn(serve_connection(
                            stream,
                            addr,
                            self.dispatcher.clone(),
                            self.requests.clone(),
                            self.drain.clone(),
                        ));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = &mut signal => break,
                _ = self.shutdown.cancelled() => break,
            }
        }

        drop(listener);
        self.shutdown.cancel();
        self.drain_connections().await;
        if let Some(watcher) = watcher {
            watcher.stop();
        }

        info!("modelgate server stopped");
        Ok(())
    }

    /// Let open connections finish, cancelling whatever outlives the drain timeout
    async fn drain_connections(&self) {
        info!(
            "Shutting down, draining {} connection(s)",
            self.connections.len()
        );
        self.drain.cancel();
        self.connections.close();

        if tokio::time::timeout(self.drain_timeout, self.connections.wait())
            .await
            .is_ok()
        {
            info!("All connections drained gracefully");
            return;
        }

        warn!(
            "Drain timeout exceeded, cancelling {} remaining connection(s)",
            self.connections.len()
        );
        self.requests.cancel();
        if tokio::time::timeout(CANCEL_GRACE, self.connections.wait())
            .await
            .is_err()
        {
            warn!("Some connections were forcefully closed");
        }
    }

    /// Wait for shutdown signal (SIGINT or SIGTERM)
    pub async fn wait_for_shutdown() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            }
            _ = terminate => {
                info!("Received terminate signal");
            }
        }
    }
}
