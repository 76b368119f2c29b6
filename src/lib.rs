//! `edgegate` is the frontend binary-protocol engine of an EdgeDB-family
//! database server: it owns a client connection, authenticates the peer,
//! runs the parse/execute loop against a backend connection, and streams
//! dump/restore payloads.
//!
//! The compiler pool ([`compiler::CompilerPool`]), the backend driver
//! ([`backend::BackendConnection`]), the per-database view
//! ([`view::DatabaseConnectionView`]) and the tenant ([`tenant::Tenant`])
//! are collaborators supplied by the embedding server.

pub mod auth;
pub mod backend;
pub mod client;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod logger;
pub mod messages;
pub mod tenant;
pub mod view;

pub use client::{ConnStatus, Connection, TransportKind};
pub use config::FrontendConfig;
pub use errors::{Error, ErrorKind};
