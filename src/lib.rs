//! # pgbridge - PostgreSQL wire protocol on top of SQLite
//!
//! pgbridge accepts PostgreSQL clients (psql, drivers, ORMs) over TCP or a
//! Unix socket and runs their statements against a single SQLite database
//! file, so that applications written for PostgreSQL can run unchanged.
//!
//! ## Architecture Overview
//!
//! 1. **Protocol Layer** (`protocol`): framing of the v3 wire protocol,
//!    startup handshake and the per-connection message loop
//! 2. **Session Layer** (`session`): prepared statements, portals, session
//!    settings and the transaction state machine
//! 3. **SQL Layer** (`sql`): classification of control statements,
//!    PostgreSQL to SQLite rewriting, system catalog emulation, result type
//!    inference and a translation cache
//! 4. **Engine Layer** (`engine`): pooled SQLite handles, the persisted type
//!    mapping catalog and execution of translated jobs
//! 5. **Types** (`types`): the PostgreSQL type registry with text and binary
//!    codecs
//!
//! ## Usage Example
//!
//! ```bash
//! # Serve ./app.db on the default port and in /tmp for psql -h /tmp
//! cargo run -- --database ./app.db --socket-dir /tmp
//!
//! psql -h 127.0.0.1 -U app -c "CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT)"
//! psql -h 127.0.0.1 -U app -c "INSERT INTO users (name) VALUES ('Alice') RETURNING id"
//! ```

/// Startup configuration (command line and environment)
pub mod config;

/// SQLite handles, type mapping catalog and job execution
pub mod engine;

/// SQLSTATE-carrying errors
pub mod error;

/// Wire protocol codec and connection handling
pub mod protocol;

/// TCP and Unix socket listeners
pub mod server;

/// Per-client state: statements, portals, settings, transactions
pub mod session;

/// Statement classification, translation and description
pub mod sql;

/// PostgreSQL type registry and value codecs
pub mod types;
