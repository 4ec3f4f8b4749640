//! PostgreSQL wire protocol client with pooling and pipelined batches.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: Connection state machine, ReadyForQuery bookkeeping, cancel requests
//! - `types`: PostgreSQL type encoding/decoding
//! - `statement`: Prepared statement cache
//! - `resource`: Generic bounded resource pool
//! - `pool`: Connection lifecycle decisions and the background health check
//! - `batch`: Pipelined multi-statement batches
//! - `context`: Cancellation tokens and deadlines
//! - `transaction`: Transaction options for `begin`

pub mod batch;
pub mod connection;
pub mod context;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod resource;
pub mod scram;
pub mod statement;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod tests;

// Public API re-exports for library consumers
pub use batch::{Batch, BatchItem, BatchRows};
pub use connection::{CommandTag, Notification, PgConfig, PgConnection, QueryResult};
pub use context::Context;
pub use error::{PgError, PgResult};
pub use pool::{AfterReleaseHook, PgPool, PgPoolConfig, PoolStat, PooledConnection};
pub use protocol::{Format, TransactionStatus};
pub use statement::{PreparedStatement, SharedColumns};
pub use transaction::{AccessMode, IsolationLevel, TxOptions};
pub use types::{Oid, PgValue};
