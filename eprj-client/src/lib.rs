//! # Epson Projector Link Client
//!
//! Purpose: Exchange request/response commands with networked projectors
//! over persistent TCP connections, skipping the dial and greeting cost on
//! every command.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: One cached connection per device key.
//! 2. **Strict Pairing**: A transaction owns its key's connection until its
//!    write and read complete, so responses never cross between callers.
//! 3. **Taint on Failure**: Any failed exchange discards the connection;
//!    the next command dials fresh.
//! 4. **Protocol Clarity**: CRLF-terminated commands, LF-terminated replies.

mod client;
mod clock;
mod codec;
mod config;
mod conn;
mod error;
mod factory;
mod info;
mod pool;
mod stats;

#[cfg(test)]
mod test_support;

pub use client::{CancelToken, ProjectorClient, DEFAULT_COMMAND_TIMEOUT};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{
    exchange, frame_command, read_response, unquote, write_command, DELIMITER, TERMINATOR,
};
pub use config::{ClientConfig, FactoryConfig, PoolConfig, DEFAULT_GREETING, DEFAULT_PORT};
pub use conn::{ConnState, Connection, ConnectionId, Deadline, TcpConnection, MAX_FRAME_LEN};
pub use error::{ClientError, ClientResult};
pub use factory::{validate_key, ConnectionFactory, TcpConnectionFactory};
pub use info::{HardwareInfo, NetworkInfo, DIAGNOSTIC_COMMANDS};
pub use pool::{ConnectionPool, Transaction};
pub use stats::PoolStats;
