//! PostgreSQL v3 message framing.
//!
//! Frontend messages are read from any `AsyncRead`; backend messages are
//! encoded into a `BytesMut` that the connection flushes at Sync, Flush or
//! the end of a simple query.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{PgError, ProtocolError};
use crate::sql::Field;
use crate::types::{encode_binary, encode_text, FormatCode, PgValue};

pub const PROTOCOL_VERSION_3: i32 = 196_608;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: i32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

const MAX_STARTUP_LEN: usize = 10_000;
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// First packet of a connection (untagged).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartupRequest {
    Startup { params: Vec<(String, String)> },
    SslRequest,
    GssEncRequest,
    Cancel { pid: i32, secret: i32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrontendMessage {
    Query(String),
    Parse {
        name: String,
        query: String,
        param_types: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<FormatCode>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<FormatCode>,
    },
    Describe {
        target: Target,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Close {
        target: Target,
        name: String,
    },
    Flush,
    Sync,
    Terminate,
}

/// Cursor over a message payload.
struct Payload(Bytes);

impl Payload {
    fn need(&self, n: usize, what: &str) -> Result<(), ProtocolError> {
        if self.0.remaining() < n {
            return Err(ProtocolError::Malformed(format!("truncated {what}")));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8, ProtocolError> {
        self.need(1, what)?;
        Ok(self.0.get_u8())
    }

    fn i16(&mut self, what: &str) -> Result<i16, ProtocolError> {
        self.need(2, what)?;
        Ok(self.0.get_i16())
    }

    fn i32(&mut self, what: &str) -> Result<i32, ProtocolError> {
        self.need(4, what)?;
        Ok(self.0.get_i32())
    }

    fn count(&mut self, what: &str) -> Result<usize, ProtocolError> {
        let n = self.i16(what)?;
        usize::try_from(n).map_err(|_| ProtocolError::Malformed(format!("negative {what}")))
    }

    fn cstring(&mut self, what: &str) -> Result<String, ProtocolError> {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ProtocolError::Malformed(format!("unterminated {what}")))?;
        let raw = self.0.split_to(end);
        self.0.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::Malformed(format!("{what} is not UTF-8")))
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<Vec<u8>, ProtocolError> {
        self.need(n, what)?;
        Ok(self.0.split_to(n).to_vec())
    }

    fn formats(&mut self, what: &str) -> Result<Vec<FormatCode>, ProtocolError> {
        let n = self.count(what)?;
        (0..n)
            .map(|_| {
                let code = self.i16(what)?;
                FormatCode::from_code(code)
                    .ok_or_else(|| ProtocolError::Malformed(format!("invalid format code {code}")))
            })
            .collect()
    }

    fn target(&mut self) -> Result<Target, ProtocolError> {
        match self.u8("target")? {
            b'S' => Ok(Target::Statement),
            b'P' => Ok(Target::Portal),
            other => Err(ProtocolError::Malformed(format!(
                "invalid target type {:?}",
                other as char
            ))),
        }
    }

    fn finish(&self, what: &str) -> Result<(), ProtocolError> {
        if self.0.has_remaining() {
            return Err(ProtocolError::Malformed(format!("trailing bytes in {what}")));
        }
        Ok(())
    }
}

async fn read_length<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<usize, ProtocolError> {
    let len = reader.read_i32().await?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::Malformed(format!("invalid length {len}")))?;
    if len < 4 {
        return Err(ProtocolError::Malformed(format!("invalid length {len}")));
    }
    if len > max {
        return Err(ProtocolError::TooLarge(len));
    }
    Ok(len - 4)
}

/// Reads the untagged first packet. Returns `Ok(None)` when the client
/// disconnects before sending anything.
pub async fn read_startup<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<StartupRequest>, ProtocolError> {
    let len = match read_length(reader, MAX_STARTUP_LEN).await {
        Ok(len) => len,
        Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_startup(Bytes::from(body)).map(Some)
}

pub fn decode_startup(body: Bytes) -> Result<StartupRequest, ProtocolError> {
    let mut payload = Payload(body);
    let code = payload.i32("startup code")?;
    match code {
        SSL_REQUEST_CODE => Ok(StartupRequest::SslRequest),
        GSSENC_REQUEST_CODE => Ok(StartupRequest::GssEncRequest),
        CANCEL_REQUEST_CODE => Ok(StartupRequest::Cancel {
            pid: payload.i32("cancel request")?,
            secret: payload.i32("cancel request")?,
        }),
        version if version >> 16 == 3 => {
            let mut params = Vec::new();
            loop {
                let key = payload.cstring("startup parameter")?;
                if key.is_empty() {
                    break;
                }
                let value = payload.cstring("startup parameter")?;
                params.push((key, value));
            }
            Ok(StartupRequest::Startup { params })
        }
        version => Err(ProtocolError::UnsupportedVersion(version as u32)),
    }
}

/// Reads one tagged message. Returns `Ok(None)` at a clean end of stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<FrontendMessage>, ProtocolError> {
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = read_length(reader, MAX_MESSAGE_LEN).await?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_message(tag, Bytes::from(body)).map(Some)
}

pub fn decode_message(tag: u8, body: Bytes) -> Result<FrontendMessage, ProtocolError> {
    let mut p = Payload(body);
    let message = match tag {
        b'Q' => FrontendMessage::Query(p.cstring("query string")?),
        b'P' => {
            let name = p.cstring("statement name")?;
            let query = p.cstring("query string")?;
            let n = p.count("parameter type count")?;
            let param_types = (0..n)
                .map(|_| p.i32("parameter type").map(|oid| oid as u32))
                .collect::<Result<_, _>>()?;
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            }
        }
        b'B' => {
            let portal = p.cstring("portal name")?;
            let statement = p.cstring("statement name")?;
            let param_formats = p.formats("parameter format")?;
            let n = p.count("parameter count")?;
            let mut params = Vec::with_capacity(n);
            for _ in 0..n {
                let len = p.i32("parameter length")?;
                params.push(match len {
                    -1 => None,
                    len if len < 0 => {
                        return Err(ProtocolError::Malformed(format!("invalid parameter length {len}")))
                    }
                    len => Some(p.bytes(len as usize, "parameter value")?),
                });
            }
            let result_formats = p.formats("result format")?;
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            }
        }
        b'D' => FrontendMessage::Describe {
            target: p.target()?,
            name: p.cstring("describe name")?,
        },
        b'E' => FrontendMessage::Execute {
            portal: p.cstring("portal name")?,
            max_rows: p.i32("row limit")?,
        },
        b'C' => FrontendMessage::Close {
            target: p.target()?,
            name: p.cstring("close name")?,
        },
        b'H' => FrontendMessage::Flush,
        b'S' => FrontendMessage::Sync,
        b'X' => FrontendMessage::Terminate,
        other => return Err(ProtocolError::UnknownTag(other as char)),
    };
    p.finish("message")?;
    Ok(message)
}

/// One column of a RowDescription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column: i16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

impl FieldDescription {
    pub fn new(field: &Field, format: FormatCode) -> Self {
        Self {
            name: field.name.clone(),
            table_oid: field.origin.map_or(0, |o| o.table_oid),
            column: field.origin.map_or(0, |o| o.attnum),
            type_oid: field.ty.oid(),
            type_len: field.ty.type_len(),
            type_modifier: field.ty.typmod(),
            format,
        }
    }

    /// Descriptions for `fields`, formats resolved from a Bind format list.
    pub fn all(fields: &[Field], formats: &[FormatCode]) -> Vec<Self> {
        fields
            .iter()
            .enumerate()
            .map(|(i, field)| Self::new(field, FormatCode::for_column(formats, i)))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery { status: u8 },
    RowDescription(Vec<FieldDescription>),
    ParameterDescription(Vec<u32>),
    NoData,
    CommandComplete(String),
    EmptyQueryResponse,
    PortalSuspended,
    ParseComplete,
    BindComplete,
    CloseComplete,
    ErrorResponse(PgError),
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Writes a tagged message, filling in the length afterwards.
fn frame(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let at = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - at) as i32;
    buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

impl BackendMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            BackendMessage::AuthenticationOk => frame(buf, b'R', |b| b.put_i32(0)),
            BackendMessage::ParameterStatus { name, value } => frame(buf, b'S', |b| {
                put_cstring(b, name);
                put_cstring(b, value);
            }),
            BackendMessage::BackendKeyData { pid, secret } => frame(buf, b'K', |b| {
                b.put_i32(*pid);
                b.put_i32(*secret);
            }),
            BackendMessage::ReadyForQuery { status } => frame(buf, b'Z', |b| b.put_u8(*status)),
            BackendMessage::RowDescription(fields) => frame(buf, b'T', |b| {
                b.put_i16(fields.len() as i16);
                for field in fields {
                    put_cstring(b, &field.name);
                    b.put_u32(field.table_oid);
                    b.put_i16(field.column);
                    b.put_u32(field.type_oid);
                    b.put_i16(field.type_len);
                    b.put_i32(field.type_modifier);
                    b.put_i16(field.format.code());
                }
            }),
            BackendMessage::ParameterDescription(oids) => frame(buf, b't', |b| {
                b.put_i16(oids.len() as i16);
                for oid in oids {
                    b.put_u32(*oid);
                }
            }),
            BackendMessage::NoData => frame(buf, b'n', |_| {}),
            BackendMessage::CommandComplete(tag) => frame(buf, b'C', |b| put_cstring(b, tag)),
            BackendMessage::EmptyQueryResponse => frame(buf, b'I', |_| {}),
            BackendMessage::PortalSuspended => frame(buf, b's', |_| {}),
            BackendMessage::ParseComplete => frame(buf, b'1', |_| {}),
            BackendMessage::BindComplete => frame(buf, b'2', |_| {}),
            BackendMessage::CloseComplete => frame(buf, b'3', |_| {}),
            BackendMessage::ErrorResponse(err) => frame(buf, b'E', |b| {
                b.put_u8(b'S');
                put_cstring(b, err.severity.as_str());
                b.put_u8(b'V');
                put_cstring(b, err.severity.as_str());
                b.put_u8(b'C');
                put_cstring(b, err.code);
                b.put_u8(b'M');
                put_cstring(b, &err.message);
                if let Some(detail) = &err.detail {
                    b.put_u8(b'D');
                    put_cstring(b, detail);
                }
                if let Some(hint) = &err.hint {
                    b.put_u8(b'H');
                    put_cstring(b, hint);
                }
                b.put_u8(0);
            }),
        }
    }
}

/// Writes a DataRow, each value in its column's format.
pub fn encode_data_row(buf: &mut BytesMut, row: &[PgValue], formats: &[FormatCode]) {
    frame(buf, b'D', |b| {
        b.put_i16(row.len() as i16);
        for (i, value) in row.iter().enumerate() {
            if value.is_null() {
                b.put_i32(-1);
                continue;
            }
            match FormatCode::for_column(formats, i) {
                FormatCode::Text => {
                    let text = encode_text(value);
                    b.put_i32(text.len() as i32);
                    b.put_slice(text.as_bytes());
                }
                FormatCode::Binary => {
                    let at = b.len();
                    b.put_i32(0);
                    encode_binary(value, b);
                    let len = (b.len() - at - 4) as i32;
                    b[at..at + 4].copy_from_slice(&len.to_be_bytes());
                }
            }
        }
    });
}
