//! Per-connection cache of server-side prepared statements.
//!
//! `PgConnection::query` fills it; the batch encoder reads it to bind cached
//! statements by name and skip their Parse message.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::protocol::FieldDescription;
use super::types::Oid;

const NAME_PREFIX: &str = "__pgpipe_";

/// Column descriptions shared between a statement and every result it produces.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// A statement parsed by the server under `name`.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    pub query: String,
    /// Filled from ParameterDescription once the server has parsed the query.
    pub param_types: Vec<Oid>,
    /// Empty when the statement answers NoData.
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: SharedColumns::default(),
        }
    }
}

pub struct StatementCache {
    entries: LruCache<String, Arc<PreparedStatement>>,
    issued: u64,
}

impl StatementCache {
    /// A capacity of zero is rounded up to one entry.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            issued: 0,
        }
    }

    /// Lookup that leaves recency untouched. Used while encoding batches.
    pub fn get(&self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.entries.peek(query).cloned()
    }

    pub fn get_and_touch(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.entries.get(query).cloned()
    }

    pub fn contains(&self, query: &str) -> bool {
        self.entries.contains(query)
    }

    /// Store `statement` under its query text and hand back whatever fell out
    /// of the cache to make room. Replacing the same query evicts nothing.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Option<Arc<PreparedStatement>> {
        let query = statement.query.clone();
        match self.entries.push(query, statement) {
            Some((key, old)) if !self.entries.contains(&key) => Some(old),
            _ => None,
        }
    }

    pub fn next_statement_name(&mut self) -> String {
        self.issued += 1;
        format!("{NAME_PREFIX}{}", self.issued)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
