//! pgpipe - PostgreSQL connection pooling and pipelined batches.
//!
//! ```ignore
//! use pgpipe::{Context, PgPool, PgPoolConfig, PgValue};
//!
//! let pool = PgPool::connect(PgPoolConfig::from_url("postgres://app@localhost/app?pool_max_conns=8")?).await?;
//! let ctx = Context::with_timeout(std::time::Duration::from_secs(5));
//!
//! let mut batch = pool.begin_batch().await?;
//! batch.queue("insert into events (kind) values ($1)", vec![PgValue::Text("signup".into())], &[], &[]);
//! batch.queue("update counters set n = n + 1 where kind = $1", vec![PgValue::Text("signup".into())], &[], &[]);
//! batch.send(&ctx, None).await?;
//! batch.exec_results().await?;
//! batch.exec_results().await?;
//! batch.close().await?;
//! ```

pub mod pg;

pub use pg::{
    Batch, BatchItem, BatchRows, CommandTag, Context, PgConfig, PgConnection, PgError, PgPool,
    PgPoolConfig, PgResult, PgValue, PoolStat, PooledConnection, TxOptions,
};
