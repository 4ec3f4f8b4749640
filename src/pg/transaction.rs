//! Transaction options.

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "read uncommitted",
            Self::ReadCommitted => "read committed",
            Self::RepeatableRead => "repeatable read",
            Self::Serializable => "serializable",
        }
    }
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

/// Options for the `begin` statement. Unset fields use the server default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub access_mode: Option<AccessMode>,
    pub deferrable: Option<bool>,
}

impl TxOptions {
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.access_mode = Some(AccessMode::ReadOnly);
        self
    }

    pub fn read_write(mut self) -> Self {
        self.access_mode = Some(AccessMode::ReadWrite);
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }

    /// The `begin` statement for these options.
    #[must_use]
    pub fn begin_sql(&self) -> String {
        let mut sql = String::from("begin");
        if let Some(level) = self.isolation_level {
            sql.push_str(" isolation level ");
            sql.push_str(level.as_sql());
        }
        match self.access_mode {
            Some(AccessMode::ReadOnly) => sql.push_str(" read only"),
            Some(AccessMode::ReadWrite) => sql.push_str(" read write"),
            None => {}
        }
        match self.deferrable {
            Some(true) => sql.push_str(" deferrable"),
            Some(false) => sql.push_str(" not deferrable"),
            None => {}
        }
        sql
    }
}
