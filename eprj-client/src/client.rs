//! # Projector Client
//!
//! Purpose: Bind one device address to a shared pool and expose a
//! single-command API to the outside world.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `ProjectorClient` hides pooling and framing.
//! 2. **Shared Pool**: Clients for many devices can share one pool; the
//!    pool is an explicit value, never a hidden global.
//! 3. **Bounded Commands**: Each write and each read has its own deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::exchange;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::factory::{validate_key, TcpConnectionFactory};
use crate::info::{query_all, HardwareInfo};
use crate::pool::ConnectionPool;

/// Default deadline for each half of a command exchange.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Cooperative cancellation flag shared between a caller and its requests.
///
/// Checked once, before a transaction starts. A transaction already running
/// is bounded only by its per-operation deadlines.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Client for one projector, backed by a (possibly shared) pool.
#[derive(Clone)]
pub struct ProjectorClient {
    address: String,
    pool: ConnectionPool,
    command_timeout: Duration,
}

impl ProjectorClient {
    /// Creates a client with its own TCP pool and default settings.
    pub fn connect(address: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(address, ClientConfig::default())
    }

    /// Creates a client with its own TCP pool built from `config`.
    pub fn with_config(address: impl Into<String>, config: ClientConfig) -> ClientResult<Self> {
        let factory = Arc::new(TcpConnectionFactory::new(config.factory.clone()));
        let pool = ConnectionPool::new(factory, config.pool.clone());
        Ok(Self::new(address, pool)?.with_command_timeout(config.command_timeout()))
    }

    /// Binds `address` to an existing pool.
    ///
    /// # Errors
    /// Returns `ClientError::InvalidKey` if the address cannot name a host.
    pub fn new(address: impl Into<String>, pool: ConnectionPool) -> ClientResult<Self> {
        let address = address.into();
        validate_key(&address)?;
        Ok(ProjectorClient {
            address,
            pool,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Sends `command` and returns the trimmed response line.
    ///
    /// The terminator is appended here; `command` should not carry one.
    pub async fn send_command(&self, cancel: &CancelToken, command: &str) -> ClientResult<String> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let command = command.to_string();
        let timeout = self.command_timeout;
        self.pool
            .transact(&self.address, move |conn| {
                Box::pin(async move { exchange(conn, &command, timeout).await })
            })
            .await
    }

    /// Reads model, network, status and timer details in one transaction.
    pub async fn hardware_info(&self, cancel: &CancelToken) -> ClientResult<HardwareInfo> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let timeout = self.command_timeout;
        let answers = self
            .pool
            .transact(&self.address, move |conn| {
                Box::pin(async move { query_all(conn, timeout).await })
            })
            .await?;

        let info = HardwareInfo::from_answers(&answers)?;
        tracing::info!(address = %self.address, ?info, "hardware info");
        Ok(info)
    }
}
