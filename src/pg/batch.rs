//! Pipelined batches.
//!
//! A [`Batch`] queues statements, sends them to the server in a single write
//! wrapped in an explicit transaction, and reads their results back in queue
//! order. The wire layout of one batch is:
//!
//! ```text
//! Query("begin ...")
//! Parse? Bind Describe(portal) Execute     -- once per item
//! Sync
//! Query("commit")
//! ```
//!
//! Parse is skipped for statements already in the connection's cache. The
//! server answers `begin` with a ReadyForQuery that `send` consumes itself;
//! Sync and `commit` each produce one more, which the connection tracks as
//! pending until `close` drains them.
//!
//! After a server error inside the pipeline the server skips everything up to
//! Sync, so later items report [`PgError::PipelineAborted`] and `commit`
//! becomes a rollback. I/O failures, protocol violations and cancellation
//! instead poison the batch: the first such error is kept and returned by
//! every later call, and the connection is marked dead and released.

use std::sync::Arc;

use bytes::BytesMut;
use smallvec::SmallVec;

use super::connection::{decode_row, CommandTag, PgConnection};
use super::context::{deadline_check, Context};
use super::error::{PgError, PgResult};
use super::pool::PooledConnection;
use super::protocol::*;
use super::statement::{SharedColumns, StatementCache};
use super::transaction::TxOptions;
use super::types::{Oid, PgValue};

/// One queued statement.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub query: String,
    pub arguments: Vec<PgValue>,
    /// Parameter types for Parse. Empty means "derive from the arguments".
    pub parameter_types: SmallVec<[Oid; 8]>,
    /// Result column formats for Bind. Empty means text for every column.
    pub result_formats: SmallVec<[Format; 4]>,
}

impl BatchItem {
    pub fn new(query: impl Into<String>, arguments: Vec<PgValue>) -> Self {
        Self {
            query: query.into(),
            arguments,
            parameter_types: SmallVec::new(),
            result_formats: SmallVec::new(),
        }
    }

    pub fn parameter_types(mut self, types: &[Oid]) -> Self {
        self.parameter_types = SmallVec::from_slice(types);
        self
    }

    pub fn result_formats(mut self, formats: &[Format]) -> Self {
        self.result_formats = SmallVec::from_slice(formats);
        self
    }

    fn parse_types(&self) -> SmallVec<[Oid; 8]> {
        if self.parameter_types.is_empty() {
            self.arguments.iter().map(PgValue::type_oid).collect()
        } else {
            self.parameter_types.clone()
        }
    }
}

enum BatchConn<'c> {
    Pooled(PooledConnection),
    Borrowed(&'c mut PgConnection),
}

impl BatchConn<'_> {
    fn get(&mut self) -> PgResult<&mut PgConnection> {
        match self {
            BatchConn::Pooled(handle) => handle.connection_mut(),
            BatchConn::Borrowed(conn) => Ok(&mut **conn),
        }
    }

    /// Hand a pooled connection back. Borrowed connections stay with their owner.
    fn release(&mut self) {
        if let BatchConn::Pooled(handle) = self {
            handle.release();
        }
    }
}

/// A pipelined batch bound to one connection.
pub struct Batch<'c> {
    conn: BatchConn<'c>,
    items: Vec<BatchItem>,
    results_read: usize,
    sent: bool,
    ctx: Context,
    /// First fatal error; returned by every call once set.
    err: Option<PgError>,
    /// The last item handed out by `query_results` still has rows on the wire.
    row_stream_open: bool,
    /// The server reported an error; it ignores the rest of the pipeline.
    aborted: bool,
    /// Server error met while discarding rows of an abandoned cursor, not yet
    /// returned to the caller.
    unreported: Option<PgError>,
    /// A server error from this batch has been returned to the caller.
    error_reported: bool,
}

impl<'c> Batch<'c> {
    fn with_conn(conn: BatchConn<'c>) -> Self {
        Self {
            conn,
            items: Vec::new(),
            results_read: 0,
            sent: false,
            ctx: Context::background(),
            err: None,
            row_stream_open: false,
            aborted: false,
            unreported: None,
            error_reported: false,
        }
    }

    pub(crate) fn borrowed(conn: &'c mut PgConnection) -> Self {
        Self::with_conn(BatchConn::Borrowed(conn))
    }

    /// Queue a statement. No I/O happens until [`send`](Self::send).
    ///
    /// Queuing after `send` poisons the batch with [`PgError::Misuse`].
    pub fn queue(
        &mut self,
        query: impl Into<String>,
        arguments: Vec<PgValue>,
        parameter_types: &[Oid],
        result_formats: &[Format],
    ) {
        self.queue_item(
            BatchItem::new(query, arguments)
                .parameter_types(parameter_types)
                .result_formats(result_formats),
        );
    }

    pub fn queue_item(&mut self, item: BatchItem) {
        if self.sent {
            self.die(PgError::Misuse("statement queued after batch was sent"));
            return;
        }
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The underlying connection, until the batch releases it.
    pub fn connection(&mut self) -> Option<&mut PgConnection> {
        self.conn.get().ok()
    }

    /// Write every queued statement in one transmission, wrapped in a
    /// transaction started with `tx_options` (plain `begin` when `None`).
    pub async fn send(&mut self, ctx: &Context, tx_options: Option<&TxOptions>) -> PgResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.sent {
            return Err(PgError::Misuse("batch already sent"));
        }

        let begin = tx_options.map_or_else(|| "begin".to_string(), TxOptions::begin_sql);
        deadline_check(ctx, &begin);
        self.ctx = ctx.clone();

        let conn = self.conn.get()?;
        conn.wait_for_previous_cancel(ctx).await?;
        ctx.run(conn.ensure_ready_for_query()).await?;

        let buf = encode_batch(conn.statement_cache(), &begin, &self.items)?;
        if let Err(err) = ctx.run(conn.send_bytes(&buf)).await {
            // Only an intact stream can be reused.
            if conn.is_closed() || conn.is_busy() {
                self.die(err.clone());
            }
            return Err(err);
        }
        conn.expect_ready_for_query(2);
        self.sent = true;
        tracing::trace!(items = self.items.len(), bytes = buf.len(), "batch sent");

        // Read through the ReadyForQuery that answers `begin`.
        loop {
            let msg = match self.recv().await {
                Ok(msg) => msg,
                Err(err) => {
                    self.die(err.clone());
                    return Err(err);
                }
            };
            let conn = self.conn.get()?;
            let handled = match msg {
                BackendMessage::ReadyForQuery { status } => {
                    conn.note_transaction_status(status);
                    return Ok(());
                }
                other => conn.process_context_free(other),
            };
            if let Err(err) = handled {
                self.die(err.clone());
                return Err(err);
            }
        }
    }

    /// Read the next item's completion tag, skipping any rows it returned.
    pub async fn exec_results(&mut self) -> PgResult<CommandTag> {
        self.next_item().await?;
        loop {
            match self.recv().await {
                Ok(BackendMessage::CommandComplete { tag }) => return Ok(CommandTag(tag)),
                Ok(BackendMessage::EmptyQueryResponse) => return Ok(CommandTag::default()),
                Ok(
                    BackendMessage::ParseComplete
                    | BackendMessage::BindComplete
                    | BackendMessage::NoData
                    | BackendMessage::RowDescription { .. }
                    | BackendMessage::DataRow { .. },
                ) => {}
                Ok(BackendMessage::ErrorResponse { fields }) => {
                    return Err(self.fail(error_from_fields(&fields)));
                }
                Ok(other) => self.context_free(other)?,
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Read the next item's column descriptions and return a cursor over
    /// its rows.
    pub async fn query_results(&mut self) -> PgResult<BatchRows<'_, 'c>> {
        self.next_item().await?;
        let fields = loop {
            match self.recv().await {
                Ok(BackendMessage::ParseComplete | BackendMessage::BindComplete) => {}
                Ok(BackendMessage::RowDescription { fields }) => break fields,
                Ok(BackendMessage::NoData) => break Vec::new(),
                Ok(BackendMessage::ErrorResponse { fields }) => {
                    return Err(self.fail(error_from_fields(&fields)));
                }
                Ok(other) => self.context_free(other)?,
                Err(err) => return Err(self.fail(err)),
            }
        };
        self.row_stream_open = true;
        Ok(BatchRows {
            batch: self,
            fields: Arc::new(fields),
            command_tag: None,
            done: false,
        })
    }

    /// First row of the next item; the remaining rows are discarded.
    pub async fn query_row_results(&mut self) -> PgResult<Vec<PgValue>> {
        let mut rows = self.query_results().await?;
        let first = rows.next().await?;
        rows.close().await?;
        first.ok_or(PgError::NoRows)
    }

    /// Consume unread results, wait for the transaction to finish, and
    /// release the connection.
    ///
    /// Returns the sticky error if the batch is poisoned, otherwise the first
    /// error met while draining, including one from `commit`. A transaction
    /// the server rolled back fails with [`PgError::PipelineAborted`] unless
    /// the caller already received the error that caused it.
    pub async fn close(mut self) -> PgResult<()> {
        let result = self.resync().await;
        if let Err(err) = &result {
            let desynced = self.conn.get().is_ok_and(|conn| conn.is_busy());
            if desynced {
                self.die(err.clone());
            }
        }
        self.conn.release();
        result
    }

    async fn resync(&mut self) -> PgResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if !self.sent {
            return Ok(());
        }

        let mut first_error = None;
        while self.results_read < self.items.len() {
            match self.exec_results().await {
                Ok(_) | Err(PgError::PipelineAborted) => {}
                Err(err) if self.err.is_some() => return Err(err),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        self.finish_open_rows().await?;

        let finished = self.finish_transaction().await;
        if let Some(err) = first_error.or_else(|| self.unreported.take()) {
            return Err(err);
        }
        if finished? && !self.error_reported {
            return Err(PgError::PipelineAborted);
        }
        Ok(())
    }

    /// Drain the Sync and `commit` acknowledgements. Returns whether the
    /// server rolled the transaction back.
    async fn finish_transaction(&mut self) -> PgResult<bool> {
        let mut rolled_back = false;
        let mut error = None;
        while self.conn.get()?.awaiting_ready_for_query() {
            match self.recv().await? {
                BackendMessage::CommandComplete { tag } => rolled_back |= tag == "ROLLBACK",
                msg @ BackendMessage::ReadyForQuery { status } => {
                    rolled_back |= status == TransactionStatus::Failed;
                    self.conn.get()?.process_context_free(msg)?;
                }
                other => {
                    if let Err(err) = self.conn.get()?.process_context_free(other) {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        error.get_or_insert(err);
                    }
                }
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(rolled_back),
        }
    }

    /// Validate that one more result may be read and step past any rows the
    /// caller left unread.
    async fn next_item(&mut self) -> PgResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if !self.sent {
            return Err(PgError::Misuse("batch results read before send"));
        }
        if let Some(err) = self.ctx.err() {
            self.die(err.clone());
            return Err(err);
        }
        if self.results_read >= self.items.len() {
            return Err(PgError::Misuse("no batch results remain"));
        }
        self.finish_open_rows().await?;
        self.results_read += 1;
        if let Some(err) = self.unreported.take() {
            self.error_reported = true;
            return Err(err);
        }
        if self.aborted {
            return Err(PgError::PipelineAborted);
        }
        Ok(())
    }

    /// Discard the rest of a row stream the caller stopped reading.
    async fn finish_open_rows(&mut self) -> PgResult<()> {
        while self.row_stream_open {
            match self.recv().await {
                Ok(BackendMessage::CommandComplete { .. } | BackendMessage::EmptyQueryResponse) => {
                    self.row_stream_open = false;
                }
                Ok(BackendMessage::DataRow { .. }) => {}
                Ok(BackendMessage::ErrorResponse { fields }) => {
                    // Belongs to the abandoned item; kept for the next read or close.
                    self.row_stream_open = false;
                    let err = error_from_fields(&fields);
                    if err.is_fatal() {
                        self.die(err.clone());
                        return Err(err);
                    }
                    self.aborted = true;
                    self.unreported.get_or_insert(err);
                }
                Ok(other) => self.context_free(other)?,
                Err(err) => return Err(self.fail(err)),
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> PgResult<BackendMessage> {
        let conn = self.conn.get()?;
        self.ctx.run(conn.rx_msg()).await
    }

    /// Messages outside the item grammar. A ReadyForQuery here means the
    /// pipeline ended before every item was answered.
    fn context_free(&mut self, msg: BackendMessage) -> PgResult<()> {
        if let BackendMessage::ReadyForQuery { .. } = msg {
            let err = PgError::Protocol("ReadyForQuery before all batch results".to_string());
            self.die(err.clone());
            return Err(err);
        }
        let handled = self.conn.get().and_then(|conn| conn.process_context_free(msg));
        handled.map_err(|err| self.fail(err))
    }

    /// Classify a read failure: a non-fatal server error aborts the rest of
    /// the pipeline, anything else poisons the batch.
    fn fail(&mut self, err: PgError) -> PgError {
        if matches!(err, PgError::Server { .. }) && !err.is_fatal() {
            self.aborted = true;
            self.error_reported = true;
        } else {
            self.die(err.clone());
        }
        err
    }

    /// Record the first fatal error, mark the connection dead and release it.
    fn die(&mut self, err: PgError) {
        if self.err.is_some() {
            return;
        }
        if let Ok(conn) = self.conn.get() {
            if matches!(err, PgError::Cancelled | PgError::Timeout) {
                conn.cancel_request();
            }
            conn.die(&err);
        }
        self.err = Some(err);
        self.conn.release();
    }
}

impl Batch<'static> {
    pub(crate) fn pooled(handle: PooledConnection) -> Self {
        Self::with_conn(BatchConn::Pooled(handle))
    }
}

/// Rows of one batch item, pulled from the connection on demand.
///
/// Dropping the cursor early is fine: the remaining rows are discarded by the
/// next read on the batch or by [`Batch::close`].
pub struct BatchRows<'b, 'c> {
    batch: &'b mut Batch<'c>,
    fields: SharedColumns,
    command_tag: Option<CommandTag>,
    done: bool,
}

impl BatchRows<'_, '_> {
    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Completion tag, once every row has been read.
    pub fn command_tag(&self) -> Option<&CommandTag> {
        self.command_tag.as_ref()
    }

    /// The next row, or `None` after the last one.
    pub async fn next(&mut self) -> PgResult<Option<Vec<PgValue>>> {
        if let Some(err) = &self.batch.err {
            return Err(err.clone());
        }
        if self.done {
            return Ok(None);
        }
        loop {
            match self.batch.recv().await {
                Ok(BackendMessage::DataRow { values }) => {
                    return decode_row(&values, &self.fields).map(Some);
                }
                Ok(BackendMessage::CommandComplete { tag }) => {
                    self.finish(CommandTag(tag));
                    return Ok(None);
                }
                Ok(BackendMessage::EmptyQueryResponse) => {
                    self.finish(CommandTag::default());
                    return Ok(None);
                }
                Ok(BackendMessage::ErrorResponse { fields }) => {
                    self.done = true;
                    self.batch.row_stream_open = false;
                    return Err(self.batch.fail(error_from_fields(&fields)));
                }
                Ok(other) => self.batch.context_free(other)?,
                Err(err) => {
                    self.done = true;
                    return Err(self.batch.fail(err));
                }
            }
        }
    }

    /// Discard remaining rows and return the completion tag.
    pub async fn close(mut self) -> PgResult<CommandTag> {
        while self.next().await?.is_some() {}
        Ok(self.command_tag.unwrap_or_default())
    }

    fn finish(&mut self, tag: CommandTag) {
        self.done = true;
        self.batch.row_stream_open = false;
        self.command_tag = Some(tag);
    }
}

/// Encode a whole batch into one buffer.
fn encode_batch(cache: &StatementCache, begin: &str, items: &[BatchItem]) -> PgResult<BytesMut> {
    let mut buf = BytesMut::with_capacity(256 * (items.len() + 1));
    QueryMessage { query: begin }.encode_to(&mut buf);

    for item in items {
        let cached = cache.get(&item.query);
        let statement = match &cached {
            Some(stmt) => stmt.name.as_str(),
            None => {
                ParseMessage {
                    name: "",
                    query: &item.query,
                    param_types: &item.parse_types(),
                }
                .try_encode_to(&mut buf)?;
                ""
            }
        };
        BindMessage {
            portal: "",
            statement,
            params: &item.arguments,
            result_formats: &item.result_formats,
        }
        .try_encode_to(&mut buf)?;
        DescribeMessage {
            kind: b'P',
            name: "",
        }
        .encode_to(&mut buf);
        ExecuteMessage {
            portal: "",
            max_rows: 0,
        }
        .encode_to(&mut buf);
    }

    SyncMessage.encode_to(&mut buf);
    QueryMessage { query: "commit" }.encode_to(&mut buf);
    Ok(buf)
}
