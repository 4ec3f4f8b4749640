//! PostgreSQL wire protocol message encoding and decoding.
//!
//! Frontend messages encode into a caller-supplied buffer so a whole batch can
//! be framed into one transmission. Backend messages are decoded from a single
//! complete frame.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::{Oid, PgValue};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Request code carried by CancelRequest in place of a protocol version.
pub const CANCEL_REQUEST_CODE: i32 = 80877102; // (1234 << 16) | 5678

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i16)]
pub enum Format {
    #[default]
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_code(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// Transaction status reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            // An unrecognised indicator is never treated as idle.
            _ => TransactionStatus::Failed,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// A message the client sends.
pub trait FrontendMessage {
    /// Append the framed message to `buf`.
    fn encode_to(&self, buf: &mut BytesMut);

    /// Encode into a fresh buffer.
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf
    }
}

/// Write `tag`, a length placeholder, the body, then patch the length.
fn framed(buf: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage<'a> {
    pub user: &'a str,
    pub database: Option<&'a str>,
    pub options: Vec<(&'a str, &'a str)>,
}

impl FrontendMessage for StartupMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, None, |b| {
            b.put_i32(PROTOCOL_VERSION);
            put_cstr(b, "user");
            put_cstr(b, self.user);
            if let Some(db) = self.database {
                put_cstr(b, "database");
                put_cstr(b, db);
            }
            for (key, value) in &self.options {
                put_cstr(b, key);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }
}

/// CancelRequest, sent on a separate connection.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, None, |b| {
            b.put_i32(CANCEL_REQUEST_CODE);
            b.put_i32(self.process_id);
            b.put_i32(self.secret_key);
        });
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'p'), |b| put_cstr(b, self.password));
    }
}

/// SASLInitialResponse ('p')
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'p'), |b| {
            put_cstr(b, self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(self.data);
        });
    }
}

/// SASLResponse ('p')
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'p'), |b| b.put_slice(self.data));
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'Q'), |b| put_cstr(b, self.query));
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'P'), |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                b.put_i32(oid.0);
            }
        });
    }
}

impl ParseMessage<'_> {
    /// Encode after checking that the type list fits its Int16 count.
    pub fn try_encode_to(&self, buf: &mut BytesMut) -> PgResult<()> {
        check_count(self.param_types.len(), "statement declares more than 32767 parameter types")?;
        self.encode_to(buf);
        Ok(())
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement.
///
/// Every parameter is sent in binary format.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [PgValue],
    pub result_formats: &'a [Format],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'B'), |b| {
            put_cstr(b, self.portal);
            put_cstr(b, self.statement);

            // A single format code applies to every parameter.
            if self.params.is_empty() {
                b.put_i16(0);
            } else {
                b.put_i16(1);
                b.put_i16(Format::Binary as i16);
            }

            b.put_i16(self.params.len() as i16);
            for param in self.params {
                param.write_param(b);
            }

            b.put_i16(self.result_formats.len() as i16);
            for fmt in self.result_formats {
                b.put_i16(*fmt as i16);
            }
        });
    }
}

impl BindMessage<'_> {
    /// Encode after checking that parameters and result formats fit their
    /// Int16 counts.
    pub fn try_encode_to(&self, buf: &mut BytesMut) -> PgResult<()> {
        check_count(self.params.len(), "statement binds more than 32767 parameters")?;
        check_count(self.result_formats.len(), "statement requests more than 32767 result formats")?;
        self.encode_to(buf);
        Ok(())
    }
}

fn check_count(len: usize, too_many: &'static str) -> PgResult<()> {
    if i16::try_from(len).is_err() {
        return Err(PgError::Misuse(too_many));
    }
    Ok(())
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'D'), |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'E'), |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'S'), |_| {});
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        framed(buf, Some(b'X'), |_| {});
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode one complete frame (type byte, length, body).
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 || buf.remaining() < (len - 4) as usize {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }
        let mut body = buf.split_to((len - 4) as usize);

        let msg = match msg_type {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from(read_u8(&mut body)?),
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: read_i32(&mut body)?,
                secret_key: read_i32(&mut body)?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let count = read_i16(&mut body)?.max(0) as usize;
                let mut type_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    type_oids.push(Oid::from(read_i32(&mut body)?));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: read_i32(&mut body)?,
                channel: read_cstring(&mut body)?,
                payload: read_cstring(&mut body)?,
            },
            other => {
                return Err(PgError::Protocol(format!(
                    "Unknown message type: {}",
                    other as char
                )))
            }
        };
        Ok(msg)
    }

    fn decode_auth(body: &mut Bytes) -> PgResult<Self> {
        let auth_type = read_i32(body)?;
        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                if body.remaining() < 4 {
                    return Err(PgError::Protocol("Truncated MD5 salt".to_string()));
                }
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue {
                data: body.split_off(0),
            }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal {
                data: body.split_off(0),
            }),
            _ => Err(PgError::Protocol(format!(
                "Unsupported authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(body: &mut Bytes) -> PgResult<Self> {
        let num_fields = read_i16(body)?.max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(body)?;
            let table_oid = read_i32(body)?;
            let column_attr = read_i16(body)?;
            let type_oid = Oid::from(read_i32(body)?);
            let type_size = read_i16(body)?;
            let type_modifier = read_i32(body)?;
            let format = Format::from_code(read_i16(body)?);

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Bytes) -> PgResult<Self> {
        let num_cols = read_i16(body)?.max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = read_i32(body)?;
            if len < 0 {
                values.push(None);
            } else if body.remaining() < len as usize {
                return Err(PgError::Protocol("Truncated DataRow value".to_string()));
            } else {
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn truncated() -> PgError {
    PgError::Protocol("Truncated message body".to_string())
}

fn read_u8(buf: &mut Bytes) -> PgResult<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut Bytes) -> PgResult<i16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut Bytes) -> PgResult<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf.iter().position(|&b| b == 0).ok_or_else(|| {
        PgError::Protocol("Missing null terminator in string".to_string())
    })?;

    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(body: &mut Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

/// Turn ErrorResponse fields into a server error.
pub fn error_from_fields(fields: &HashMap<u8, String>) -> PgError {
    PgError::Server {
        // V is never localized but only sent since 9.6.
        severity: fields
            .get(&b'V')
            .or_else(|| fields.get(&b'S'))
            .cloned()
            .unwrap_or_default(),
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
    }
}
