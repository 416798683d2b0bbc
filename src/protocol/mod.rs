//! PostgreSQL v3 frontend/backend protocol.
//!
//! [`messages`] frames and parses individual messages; [`Connection`] runs
//! the startup handshake and the simple/extended query state machine on top
//! of a [`Session`](crate::session::Session).

mod connection;
pub mod messages;

pub use connection::Connection;
