//! The compiler pool as seen from the protocol engine, and the artifacts it
//! returns.
//!
//! The pool itself is an external collaborator (an RPC surface); the engine
//! owns only the request fingerprint, the compiled-unit model, and the
//! dump/restore descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::errors::{BackendErrorFields, Error};
use crate::messages::codec::ProtocolVersion;
use crate::messages::constants::*;

/// Capability bits a query unit may require and a connection may grant.
pub mod capability {
    pub const MODIFICATIONS: u64 = 1 << 0;
    pub const SESSION_CONFIG: u64 = 1 << 1;
    pub const TRANSACTION: u64 = 1 << 2;
    pub const DDL: u64 = 1 << 3;
    pub const PERSISTENT_CONFIG: u64 = 1 << 4;
    pub const ALL: u64 = u64::MAX;

    const NAMES: [(u64, &str); 5] = [
        (MODIFICATIONS, "modifications"),
        (SESSION_CONFIG, "session configuration"),
        (TRANSACTION, "transaction control"),
        (DDL, "DDL"),
        (PERSISTENT_CONFIG, "persistent configuration"),
    ];

    /// The lowest capability bit in `required` that `allowed` does not
    /// grant, as a human-readable name.
    pub fn first_disabled(required: u64, allowed: u64) -> Option<&'static str> {
        let missing = required & !allowed;
        if missing == 0 {
            return None;
        }
        for (bit, name) in NAMES {
            if missing & bit != 0 {
                return Some(name);
            }
        }
        Some("unknown capability")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Binary,
    Json,
    JsonElements,
    None,
}

impl OutputFormat {
    pub fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            FORMAT_BINARY => Ok(OutputFormat::Binary),
            FORMAT_JSON => Ok(OutputFormat::Json),
            FORMAT_JSON_ELEMENTS => Ok(OutputFormat::JsonElements),
            FORMAT_NONE => Ok(OutputFormat::None),
            _ => Err(Error::binary_protocol(format!(
                "unknown output format: {:#04x}",
                b
            ))),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            OutputFormat::Binary => FORMAT_BINARY,
            OutputFormat::Json => FORMAT_JSON,
            OutputFormat::JsonElements => FORMAT_JSON_ELEMENTS,
            OutputFormat::None => FORMAT_NONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cardinality {
    NoResult,
    AtMostOne,
    #[default]
    Many,
}

impl Cardinality {
    pub fn as_byte(&self) -> u8 {
        match self {
            Cardinality::NoResult => CARDINALITY_NO_RESULT,
            Cardinality::AtMostOne => CARDINALITY_AT_MOST_ONE,
            Cardinality::Many => CARDINALITY_MANY,
        }
    }
}

/// The fingerprint of a parse/execute request. Equality and hash cover all
/// fields; it is the compiled-query cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryRequestInfo {
    /// Tokenized source text. When `normalized` is set, string and numeric
    /// literals have been replaced by implicit parameters.
    pub source: String,
    pub normalized: bool,
    pub protocol_version: ProtocolVersion,
    pub output_format: OutputFormat,
    pub expect_one: bool,
    /// 0 means unlimited.
    pub implicit_limit: u64,
    pub inline_typeids: bool,
    pub inline_typenames: bool,
    pub inline_objectids: bool,
    pub allow_capabilities: u64,
}

impl QueryRequestInfo {
    /// Deterministic hash for the single-slot anonymous-compiled cache.
    /// xxh3 over a canonical field encoding, so it is stable across runs
    /// (unlike `DefaultHasher`).
    pub fn stable_hash(&self) -> u64 {
        let mut enc = BytesMut::with_capacity(self.source.len() + 64);
        enc.put_slice(self.source.as_bytes());
        enc.put_u8(0);
        enc.put_u8(self.normalized as u8);
        enc.put_u16(self.protocol_version.major);
        enc.put_u16(self.protocol_version.minor);
        enc.put_u8(self.output_format.as_byte());
        enc.put_u8(self.expect_one as u8);
        enc.put_u64(self.implicit_limit);
        enc.put_u8(self.inline_typeids as u8);
        enc.put_u8(self.inline_typenames as u8);
        enc.put_u8(self.inline_objectids as u8);
        enc.put_u64(self.allow_capabilities);
        xxh3_64(&enc)
    }
}

/// JSON-encoded configuration operation produced by `SET GLOBAL` /
/// `CONFIGURE` statements, either statically by the compiler or read back
/// from the backend at execution time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOp(pub serde_json::Value);

impl ConfigOp {
    /// Readback rows are `0x01` followed by one JSON operation.
    pub fn from_readback_row(row: &[u8]) -> Result<Self, Error> {
        match row.first() {
            Some(0x01) => {}
            _ => {
                return Err(Error::internal(
                    "malformed config readback row from the backend",
                ))
            }
        }
        let value: serde_json::Value = serde_json::from_slice(&row[1..])
            .map_err(|e| Error::internal(format!("bad config op JSON: {e}")))?;
        Ok(ConfigOp(value))
    }

    pub fn setting_name(&self) -> Option<&str> {
        self.0.get("name").and_then(|v| v.as_str())
    }

    /// `CONFIGURE INSTANCE` operations carry the instance scope marker.
    pub fn is_instance_scope(&self) -> bool {
        self.0.get("scope").and_then(|v| v.as_str()) == Some("INSTANCE")
    }
}

/// The compiler's atomic execution step.
#[derive(Debug, Clone, Default)]
pub struct QueryUnit {
    /// Backend SQL statements this unit executes, in order.
    pub sql: Vec<String>,
    /// Status tag for CommandComplete, e.g. `SELECT`.
    pub status: String,
    pub cardinality: Cardinality,
    pub capabilities: u64,
    pub cacheable: bool,

    pub in_type_id: Uuid,
    pub in_type_data: Bytes,
    pub out_type_id: Uuid,
    pub out_type_data: Bytes,

    /// Backend prepared-statement name, present when the unit should be
    /// executed through a named prepared statement.
    pub sql_hash: Option<String>,

    // Transactional roles.
    pub tx_id: Option<u64>,
    pub tx_commit: bool,
    pub tx_rollback: bool,
    pub tx_savepoint_declare: bool,
    pub tx_savepoint_rollback: bool,
    pub tx_abort_migration: bool,
    pub savepoint_name: Option<String>,

    pub ddl_stmt_id: Option<String>,
    pub needs_readback: bool,
    pub is_explain: bool,
    pub create_db: Option<String>,
    pub drop_db: Option<String>,
    pub create_db_template: Option<String>,
    pub system_config: bool,
    pub backend_config: bool,
    pub database_config: bool,

    /// Statically compiled config operations, applied when no readback
    /// happens.
    pub config_ops: Vec<ConfigOp>,
}

impl QueryUnit {
    pub fn is_rollback_like(&self) -> bool {
        self.tx_savepoint_rollback || self.tx_abort_migration || self.tx_rollback
    }
}

/// Ordered, non-empty group of units a single compile produced.
#[derive(Debug, Clone, Default)]
pub struct QueryUnitGroup {
    pub units: Vec<QueryUnit>,
    /// The group's actual cardinality (the last data-producing unit's).
    pub cardinality: Cardinality,
}

impl QueryUnitGroup {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn first(&self) -> &QueryUnit {
        &self.units[0]
    }

    pub fn last(&self) -> &QueryUnit {
        self.units.last().expect("empty query unit group")
    }

    pub fn capabilities(&self) -> u64 {
        self.units.iter().fold(0, |acc, u| acc | u.capabilities)
    }

    /// Bind arguments are declared by the first unit.
    pub fn in_type_id(&self) -> Uuid {
        self.first().in_type_id
    }

    pub fn in_type_data(&self) -> &Bytes {
        &self.first().in_type_data
    }

    /// The group's output shape is the last unit's.
    pub fn out_type_id(&self) -> Uuid {
        self.last().out_type_id
    }

    pub fn out_type_data(&self) -> &Bytes {
        &self.last().out_type_data
    }

    /// A group longer than one unit, or any unit the server itself must
    /// read data back from, runs as a script.
    pub fn needs_script(&self) -> bool {
        self.units.len() > 1 || self.units.iter().any(|u| u.needs_readback)
    }

    pub fn cacheable(&self) -> bool {
        self.units.iter().all(|u| u.cacheable)
    }
}

/// Output of the compiler for one fingerprint.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub group: Arc<QueryUnitGroup>,
    /// Index where implicit (extracted-literal) arguments start, when the
    /// source was normalized.
    pub first_extra: Option<usize>,
    pub extra_counts: Vec<u32>,
    pub extra_blobs: Vec<Bytes>,
}

impl CompiledQuery {
    pub fn new(group: QueryUnitGroup) -> Self {
        CompiledQuery {
            group: Arc::new(group),
            first_extra: None,
            extra_counts: Vec::new(),
            extra_blobs: Vec::new(),
        }
    }
}

/// Reshape client bind args into the backend's binary format, appending the
/// extracted-literal blob when the source was normalized. Client args start
/// with an i32 element count.
pub fn recode_bind_args(compiled: &CompiledQuery, client_args: &[u8]) -> Result<Bytes, Error> {
    let Some(first_extra) = compiled.first_extra else {
        return Ok(Bytes::copy_from_slice(client_args));
    };
    if client_args.len() < 4 {
        return Err(Error::binary_protocol("bind args shorter than the count"));
    }
    let declared =
        i32::from_be_bytes([client_args[0], client_args[1], client_args[2], client_args[3]]);
    if declared < 0 || declared as usize != first_extra {
        return Err(Error::binary_protocol(format!(
            "expected {first_extra} bind argument(s), got {declared}"
        )));
    }
    let extra_count = compiled.extra_counts.first().copied().unwrap_or(0);
    let mut out = BytesMut::with_capacity(client_args.len() + 16);
    out.put_i32(declared + extra_count as i32);
    out.put_slice(&client_args[4..]);
    if let Some(blob) = compiled.extra_blobs.first() {
        out.put_slice(blob);
    }
    Ok(out.freeze())
}

/// One typed element of a dump header.
#[derive(Debug, Clone)]
pub struct DumpTypeInfo {
    pub type_name: String,
    pub type_desc: String,
    pub type_id: Uuid,
}

/// One dumpable object: the copy source and its dependencies.
#[derive(Debug, Clone)]
pub struct DumpBlockDesc {
    pub schema_object_id: Uuid,
    pub type_desc: Bytes,
    pub schema_deps: Vec<Uuid>,
}

/// Everything the dump engine needs, produced by the compiler from the
/// introspected schemas.
#[derive(Debug, Clone)]
pub struct DumpDescriptor {
    pub schema_ddl: String,
    /// Statements that must run inside the dump snapshot; any scalar
    /// result is appended to the schema DDL.
    pub dynamic_ddl: Vec<String>,
    pub types: Vec<DumpTypeInfo>,
    pub blocks: Vec<DumpBlockDesc>,
}

/// A tree of descriptors; nodes naming a schema type id need their backend
/// representation re-resolved in the destination database.
#[derive(Debug, Clone, Default)]
pub struct DataMendingDesc {
    pub schema_type_id: Option<Uuid>,
    pub needs_mending: bool,
    pub children: Vec<DataMendingDesc>,
}

#[derive(Debug, Clone)]
pub struct RestoreBlockDesc {
    pub schema_object_id: Uuid,
    /// COPY statement ingesting this block's data.
    pub sql_copy_stmt: String,
    pub data_mending_desc: Option<DataMendingDesc>,
}

#[derive(Debug, Clone)]
pub struct RestoreDescriptor {
    /// Schema replay units, in order.
    pub units: Vec<QueryUnit>,
    pub blocks: HashMap<Uuid, RestoreBlockDesc>,
    /// Tables whose triggers are disabled for the duration of the load.
    pub tables_to_disable_triggers: Vec<String>,
}

/// The dump-file header as parsed by restore and handed to the compiler.
#[derive(Debug, Clone)]
pub struct DumpRestoreHeader {
    pub server_version: Option<String>,
    pub catalog_version: Option<i64>,
    pub dump_version: ProtocolVersion,
    pub schema_ddl: Bytes,
    pub types: Vec<DumpTypeInfo>,
    pub blocks: Vec<DumpBlockDesc>,
}

/// RPC surface of the compiler pool.
pub trait CompilerPool: Send + Sync {
    fn compile(
        &self,
        dbname: &str,
        req: &QueryRequestInfo,
    ) -> impl std::future::Future<Output = Result<CompiledQuery, Error>> + Send;

    fn describe_database_dump(
        &self,
        user_schema_json: &[u8],
        global_schema_json: &[u8],
        db_config_json: &[u8],
        protocol_version: ProtocolVersion,
    ) -> impl std::future::Future<Output = Result<DumpDescriptor, Error>> + Send;

    fn describe_database_restore(
        &self,
        header: &DumpRestoreHeader,
    ) -> impl std::future::Future<Output = Result<RestoreDescriptor, Error>> + Send;

    fn analyze_explain_output(
        &self,
        req: &QueryRequestInfo,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<Bytes, Error>> + Send;

    /// Schema-aware translation of a backend error the static pass could
    /// not fully interpret.
    fn interpret_backend_error(
        &self,
        fields: &BackendErrorFields,
    ) -> impl std::future::Future<Output = Result<Error, Error>> + Send;
}
