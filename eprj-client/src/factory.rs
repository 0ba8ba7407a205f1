//! # Connection Factory
//!
//! Purpose: Dial a device and validate its greeting, producing a connection
//! that is ready for the first command.
//!
//! ## Design Principles
//! 1. **All or Nothing**: A connection that failed its handshake is closed
//!    here and never handed to the caller.
//! 2. **No Retries**: Retry policy belongs to whoever calls the pool.
//! 3. **Bounded Waits**: Both the dial and the greeting have a deadline.

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::codec::read_response;
use crate::config::FactoryConfig;
use crate::conn::{Connection, TcpConnection};
use crate::error::{ClientError, ClientResult};

/// Produces validated connections for a key.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, key: &str) -> ClientResult<Box<dyn Connection>>;
}

/// Dials `key:port` over TCP and expects the configured greeting.
#[derive(Debug, Clone, Default)]
pub struct TcpConnectionFactory {
    config: FactoryConfig,
}

impl TcpConnectionFactory {
    pub fn new(config: FactoryConfig) -> Self {
        TcpConnectionFactory { config }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    async fn dial(&self, key: &str) -> ClientResult<TcpStream> {
        let timeout = self.config.dial_timeout();
        let connect = TcpStream::connect((key, self.config.port));
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    addr: key.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    addr: key.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no connection within {:?}", timeout),
                    ),
                })
            }
        };
        // Commands are tiny; Nagle would only add latency.
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn handshake(&self, conn: &mut TcpConnection) -> ClientResult<()> {
        let greeting = read_response(conn, self.config.greeting_timeout())
            .await
            .map_err(|err| ClientError::Handshake {
                addr: conn.addr().to_string(),
                reason: format!("no greeting: {}", err),
            })?;

        if greeting != self.config.greeting {
            return Err(ClientError::Handshake {
                addr: conn.addr().to_string(),
                reason: format!("unexpected message when opening connection: {:?}", greeting),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn create(&self, key: &str) -> ClientResult<Box<dyn Connection>> {
        validate_key(key)?;

        let stream = self.dial(key).await?;
        let mut conn = TcpConnection::new(stream, key);

        if let Err(err) = self.handshake(&mut conn).await {
            let _ = conn.close().await;
            tracing::warn!(parent: conn.span(), error = %err, "handshake rejected");
            return Err(err);
        }

        tracing::info!(parent: conn.span(), "connection established");
        Ok(Box::new(conn))
    }
}

/// Rejects keys that cannot name a host.
pub fn validate_key(key: &str) -> ClientResult<()> {
    if key.is_empty() || key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ClientError::InvalidKey(key.to_string()));
    }
    Ok(())
}
