use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, trace, warn};

use super::messages::{
    encode_data_row, read_message, read_startup, BackendMessage, FieldDescription, FrontendMessage,
    StartupRequest, Target,
};
use crate::error::{sqlstate, PgError, ProtocolError, Severity};
use crate::session::{Completion, Session, Shared};
use crate::types::FormatCode;

/// Output is written out once this much is buffered, even mid-result.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// One client connection: startup handshake followed by the message loop.
///
/// Generic over the transport so the same code serves TCP and Unix sockets.
pub struct Connection<S> {
    stream: BufReader<S>,
    out: BytesMut,
    peer: String,
    /// Set after an extended-protocol error; everything up to the next Sync
    /// is discarded.
    skip_until_sync: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            out: BytesMut::with_capacity(8 * 1024),
            peer: peer.into(),
            skip_until_sync: false,
        }
    }

    fn send(&mut self, message: BackendMessage) {
        message.encode(&mut self.out);
    }

    async fn flush(&mut self) -> Result<(), ProtocolError> {
        if !self.out.is_empty() {
            self.stream.write_all(&self.out).await?;
            self.out.clear();
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn flush_if_full(&mut self) -> Result<(), ProtocolError> {
        if self.out.len() >= FLUSH_THRESHOLD {
            self.flush().await?;
        }
        Ok(())
    }

    /// Sends an error the client cannot recover from and flushes it.
    async fn reject(&mut self, err: PgError) -> Result<(), ProtocolError> {
        self.send(BackendMessage::ErrorResponse(err));
        self.flush().await
    }

    /// Runs the connection to completion.
    ///
    /// ## Connection Lifecycle
    /// 1. SSLRequest / GSSENCRequest are declined with `N`; CancelRequest
    ///    closes the socket
    /// 2. StartupMessage: a connection slot and a session are set up, then
    ///    AuthenticationOk, ParameterStatus, BackendKeyData, ReadyForQuery
    /// 3. Messages are handled until Terminate or end of stream
    /// 4. The session is closed, rolling back any open transaction
    ///
    /// ## Returns
    /// * `Ok(())` - the client went away or terminated
    /// * `Err(_)` - framing or I/O failure; the connection is dropped
    pub async fn run(mut self, shared: Arc<Shared>) -> Result<(), ProtocolError> {
        let params = loop {
            match read_startup(&mut self.stream).await? {
                None => return Ok(()),
                Some(StartupRequest::SslRequest) | Some(StartupRequest::GssEncRequest) => {
                    self.stream.write_all(b"N").await?;
                    self.stream.flush().await?;
                }
                Some(StartupRequest::Cancel { pid, .. }) => {
                    debug!(peer = %self.peer, pid, "cancel request ignored");
                    return Ok(());
                }
                Some(StartupRequest::Startup { params }) => break params,
            }
        };

        let slot = match shared.register() {
            Ok(slot) => slot,
            Err(err) => {
                warn!(peer = %self.peer, "connection limit reached");
                return self.reject(err).await;
            }
        };
        let mut session = match Session::open(Arc::clone(&shared), slot.pid(), &params).await {
            Ok(session) => session,
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "session setup failed");
                return self.reject(PgError { severity: Severity::Fatal, ..err }).await;
            }
        };

        self.send(BackendMessage::AuthenticationOk);
        for (name, value) in session.settings().reported() {
            self.send(BackendMessage::ParameterStatus { name, value });
        }
        self.send(BackendMessage::BackendKeyData {
            pid: session.pid(),
            secret: rand::random::<i32>(),
        });
        self.ready(&session);
        let result = match self.flush().await {
            Ok(()) => self.serve(&mut session).await,
            Err(err) => Err(err),
        };

        session.close().await;
        drop(slot);
        if let Err(err) = &result {
            if let ProtocolError::Io(_) = err {
                debug!(peer = %self.peer, error = %err, "connection lost");
            } else {
                warn!(peer = %self.peer, error = %err, "protocol error");
            }
        }
        info!(peer = %self.peer, "client disconnected");
        result
    }

    fn ready(&mut self, session: &Session) {
        self.send(BackendMessage::ReadyForQuery {
            status: session.transaction_state().status_byte(),
        });
    }

    async fn serve(&mut self, session: &mut Session) -> Result<(), ProtocolError> {
        loop {
            let message = match read_message(&mut self.stream).await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(err @ ProtocolError::Io(_)) => return Err(err),
                Err(err) => {
                    self.reject(PgError::fatal(sqlstate::PROTOCOL_VIOLATION, err.to_string()))
                        .await?;
                    return Err(err);
                }
            };
            trace!(session = session.pid(), ?message, "message");
            match message {
                FrontendMessage::Terminate => return Ok(()),
                FrontendMessage::Sync => {
                    self.skip_until_sync = false;
                    session.sync();
                    self.ready(session);
                    self.flush().await?;
                }
                FrontendMessage::Flush => self.flush().await?,
                _ if self.skip_until_sync => {}
                FrontendMessage::Query(sql) => {
                    self.simple_query(session, &sql).await?;
                    self.ready(session);
                    self.flush().await?;
                }
                message => {
                    if let Err(err) = self.extended(session, message).await? {
                        debug!(session = session.pid(), code = err.code, error = %err, "extended query failed");
                        self.send(BackendMessage::ErrorResponse(err));
                        session.fail().await;
                        self.skip_until_sync = true;
                    }
                }
            }
        }
    }

    async fn simple_query(&mut self, session: &mut Session, sql: &str) -> Result<(), ProtocolError> {
        let (completions, err) = session.simple_query(sql).await;
        for completion in completions {
            if let Some(fields) = &completion.fields {
                self.send(BackendMessage::RowDescription(FieldDescription::all(fields, &[])));
            }
            self.write_completion(completion, &[]).await?;
        }
        if let Some(err) = err {
            self.send(BackendMessage::ErrorResponse(err));
        }
        Ok(())
    }

    /// Rows, ParameterStatus and the closing message of one completion.
    async fn write_completion(&mut self, completion: Completion, formats: &[FormatCode]) -> Result<(), ProtocolError> {
        for row in &completion.rows {
            encode_data_row(&mut self.out, row, formats);
            self.flush_if_full().await?;
        }
        for (name, value) in completion.parameter_status {
            self.send(BackendMessage::ParameterStatus { name, value });
        }
        if completion.suspended {
            self.send(BackendMessage::PortalSuspended);
        } else {
            match completion.tag {
                Some(tag) => self.send(BackendMessage::CommandComplete(tag)),
                None => self.send(BackendMessage::EmptyQueryResponse),
            }
        }
        Ok(())
    }

    /// Handles one extended-protocol message. The outer `Result` is for
    /// connection failures, the inner one for errors reported to the client.
    async fn extended(
        &mut self,
        session: &mut Session,
        message: FrontendMessage,
    ) -> Result<Result<(), PgError>, ProtocolError> {
        let outcome = match message {
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => session
                .parse(&name, &query, &param_types)
                .await
                .map(|()| self.send(BackendMessage::ParseComplete)),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => session
                .bind(&portal, &statement, &param_formats, &params, &result_formats)
                .map(|()| self.send(BackendMessage::BindComplete)),
            FrontendMessage::Describe {
                target: Target::Statement,
                name,
            } => session.describe_statement(&name).map(|(params, fields)| {
                self.send(BackendMessage::ParameterDescription(params));
                match fields {
                    Some(fields) => self.send(BackendMessage::RowDescription(FieldDescription::all(&fields, &[]))),
                    None => self.send(BackendMessage::NoData),
                }
            }),
            FrontendMessage::Describe {
                target: Target::Portal,
                name,
            } => session.describe_portal(&name).map(|description| match description {
                Some((fields, formats)) => {
                    self.send(BackendMessage::RowDescription(FieldDescription::all(&fields, &formats)))
                }
                None => self.send(BackendMessage::NoData),
            }),
            FrontendMessage::Execute { portal, max_rows } => {
                let formats = session.portal_formats(&portal);
                match session.execute(&portal, max_rows.max(0) as usize).await {
                    Ok(completion) => {
                        self.write_completion(completion, &formats).await?;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            FrontendMessage::Close { target, name } => {
                match target {
                    Target::Statement => session.close_statement(&name),
                    Target::Portal => session.close_portal(&name),
                }
                self.send(BackendMessage::CloseComplete);
                Ok(())
            }
            FrontendMessage::Query(_) | FrontendMessage::Flush | FrontendMessage::Sync | FrontendMessage::Terminate => {
                Ok(())
            }
        };
        Ok(outcome)
    }
}
