//! The backend PostgreSQL-family connection as seen from the protocol
//! engine.
//!
//! The real driver lives elsewhere; the engine only needs an opaque channel
//! it can push compiled SQL through, plus the bulk dump/restore entry
//! points. Errors come back with their SQLSTATE fields attached so the
//! dispatcher can interpret them (see `errors::static_interpret_backend_error`).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::compiler::{DumpBlockDesc, QueryUnit, RestoreBlockDesc};
use crate::errors::Error;
use crate::messages::codec::MessageWriter;

/// How a pipelined send is fenced. A `Sync` closes the implicit backend
/// transaction; a `Flush` keeps it open for readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFence {
    Flush,
    Sync,
}

/// One `parse_execute` call.
pub struct ExecuteParams<'a> {
    pub unit: &'a QueryUnit,
    pub bind_args: &'a [u8],
    /// Session state to install before execution; `None` elides the state
    /// roundtrip because the backend already holds it.
    pub state: Option<&'a [u8]>,
    pub use_prep_stmt: bool,
    pub fence: BatchFence,
}

/// New backend type ids minted by a DDL statement: schema type id to
/// backend type id.
pub type NewTypes = HashMap<Uuid, u32>;

/// One chunk of dump data produced by the backend.
#[derive(Debug, Clone)]
pub struct DumpChunk {
    /// Index into the block list passed to [`BackendConnection::dump`].
    pub block_index: usize,
    pub block_num: u64,
    pub data: Bytes,
}

/// Opaque backend channel. One connection is held per execute/dump/restore
/// and released in `finally`; it is never held across a Sync boundary.
pub trait BackendConnection: Send + 'static {
    fn in_tx(&self) -> bool;

    /// The session state the backend currently holds, as last installed.
    fn last_state(&self) -> Option<Bytes>;
    fn set_last_state(&mut self, state: Bytes);

    /// Run one or more `;`-separated utility statements, discarding output.
    fn sql_execute(&mut self, sql: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Run a single statement and return the first column of the first
    /// row, if any.
    fn sql_fetch_val(
        &mut self,
        sql: &str,
    ) -> impl Future<Output = Result<Option<Bytes>, Error>> + Send;

    /// Run a single statement carrying session state and return the first
    /// column of every row.
    fn sql_fetch_col(
        &mut self,
        sql: &str,
        state: Option<&[u8]>,
    ) -> impl Future<Output = Result<Vec<Bytes>, Error>> + Send;

    /// Execute a compiled unit. When `frontend` is given, data rows are
    /// forwarded into it as `D` frames and the returned vector is empty;
    /// otherwise rows are collected and returned (readback, explain).
    fn parse_execute(
        &mut self,
        params: ExecuteParams<'_>,
        frontend: Option<&mut MessageWriter>,
    ) -> impl Future<Output = Result<Vec<Bytes>, Error>> + Send;

    /// Run a DDL unit, returning any backend type ids it minted.
    fn run_ddl(
        &mut self,
        unit: &QueryUnit,
        state: Option<&[u8]>,
    ) -> impl Future<Output = Result<Option<NewTypes>, Error>> + Send;

    /// Issue a SYNC to close a pipeline left open by a `Flush` fence.
    fn sync(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Poison the pipeline with a known error so that a half-sent script
    /// cannot leave it in an ambiguous state.
    fn force_error(&mut self) -> impl Future<Output = ()> + Send;

    // Introspection helpers used by dump.
    fn user_schema_json(&mut self) -> impl Future<Output = Result<Bytes, Error>> + Send;
    fn global_schema_json(&mut self) -> impl Future<Output = Result<Bytes, Error>> + Send;
    fn db_config_json(
        &mut self,
        include_secrets: bool,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Walk `blocks` in order, pushing chunks into `output`. The bounded
    /// channel provides backpressure; `cancelled` is checked between
    /// chunks. The sender is dropped on return, which is the consumer's
    /// end-of-stream signal.
    fn dump(
        &mut self,
        blocks: Vec<DumpBlockDesc>,
        output: mpsc::Sender<DumpChunk>,
        cancelled: Arc<AtomicBool>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Ingest one restore block. `type_id_map` maps source schema type ids
    /// to this database's backend type ids; the driver rewrites embedded
    /// ids while copying.
    fn restore(
        &mut self,
        block: &RestoreBlockDesc,
        data: &[u8],
        type_id_map: &HashMap<Uuid, u32>,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
