//! Mock collaborators for connection tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::jwt::JwtKeyRing;
use crate::backend::{
    BackendConnection, BatchFence, DumpChunk, ExecuteParams, NewTypes,
};
use crate::compiler::{
    CompiledQuery, CompilerPool, ConfigOp, DumpDescriptor, DumpRestoreHeader, QueryRequestInfo,
    QueryUnit, RestoreDescriptor,
};
use crate::errors::{BackendErrorFields, Error, ErrorKind};
use crate::messages::codec::ProtocolVersion;
use crate::messages::server;
use crate::tenant::{AuthPolicy, Readiness, Tenant};
use crate::view::{DatabaseConnectionView, SideEffect};

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// One recorded `parse_execute` call.
#[derive(Debug, Clone)]
pub struct ExecuteCall {
    pub sql: Vec<String>,
    pub state: Option<Vec<u8>>,
    pub use_prep_stmt: bool,
    pub fence: BatchFence,
    pub forwarded: bool,
}

#[derive(Default)]
pub struct BackendLog {
    pub sql: Vec<String>,
    pub executes: Vec<ExecuteCall>,
    pub ddl: Vec<String>,
    pub restore_calls: Vec<(Uuid, Vec<u8>, HashMap<Uuid, u32>)>,
    pub syncs: usize,
    pub forced_errors: usize,
    pub last_state: Option<Bytes>,
    pub in_tx: bool,
    pub released: usize,
}

/// Canned behavior shared by every backend the mock tenant hands out.
#[derive(Default)]
pub struct BackendScript {
    /// Rows returned by `sql_fetch_col` / collected `parse_execute`, keyed
    /// by the first SQL statement.
    pub rows_by_sql: HashMap<String, Vec<Bytes>>,
    /// Fail `sql_execute` / `parse_execute` whose first statement matches.
    pub fail_on_sql: HashMap<String, BackendErrorFields>,
    /// Chunks produced by `dump`, as (block_index, block_num, data).
    pub dump_chunks: Vec<(usize, u64, Bytes)>,
    pub user_schema_json: Bytes,
    pub global_schema_json: Bytes,
    pub db_config_json: Bytes,
}

pub struct MockBackend {
    pub log: Arc<Mutex<BackendLog>>,
    pub script: Arc<BackendScript>,
}

impl MockBackend {
    fn check_fail(&self, sql: &str) -> Result<(), Error> {
        if let Some(fields) = self.script.fail_on_sql.get(sql) {
            return Err(Error::from_backend(fields.clone()));
        }
        Ok(())
    }
}

impl BackendConnection for MockBackend {
    fn in_tx(&self) -> bool {
        self.log.lock().in_tx
    }

    fn last_state(&self) -> Option<Bytes> {
        self.log.lock().last_state.clone()
    }

    fn set_last_state(&mut self, state: Bytes) {
        self.log.lock().last_state = Some(state);
    }

    async fn sql_execute(&mut self, sql: &str) -> Result<(), Error> {
        self.check_fail(sql)?;
        let mut log = self.log.lock();
        log.sql.push(sql.to_string());
        if sql.to_ascii_uppercase().contains("START TRANSACTION") {
            log.in_tx = true;
        }
        if sql.eq_ignore_ascii_case("commit") || sql.eq_ignore_ascii_case("rollback") {
            log.in_tx = false;
        }
        Ok(())
    }

    async fn sql_fetch_val(&mut self, sql: &str) -> Result<Option<Bytes>, Error> {
        self.check_fail(sql)?;
        self.log.lock().sql.push(sql.to_string());
        Ok(self
            .script
            .rows_by_sql
            .get(sql)
            .and_then(|rows| rows.first().cloned()))
    }

    async fn sql_fetch_col(&mut self, sql: &str, _state: Option<&[u8]>) -> Result<Vec<Bytes>, Error> {
        self.check_fail(sql)?;
        self.log.lock().sql.push(sql.to_string());
        Ok(self.script.rows_by_sql.get(sql).cloned().unwrap_or_default())
    }

    async fn parse_execute(
        &mut self,
        params: ExecuteParams<'_>,
        frontend: Option<&mut crate::messages::codec::MessageWriter>,
    ) -> Result<Vec<Bytes>, Error> {
        let first_sql = params.unit.sql.first().cloned().unwrap_or_default();
        self.check_fail(&first_sql)?;
        self.log.lock().executes.push(ExecuteCall {
            sql: params.unit.sql.clone(),
            state: params.state.map(|s| s.to_vec()),
            use_prep_stmt: params.use_prep_stmt,
            fence: params.fence,
            forwarded: frontend.is_some(),
        });
        let rows = self
            .script
            .rows_by_sql
            .get(&first_sql)
            .cloned()
            .unwrap_or_default();
        match frontend {
            Some(out) => {
                for row in &rows {
                    server::data_row(out, row);
                }
                Ok(Vec::new())
            }
            None => Ok(rows),
        }
    }

    async fn run_ddl(
        &mut self,
        unit: &QueryUnit,
        _state: Option<&[u8]>,
    ) -> Result<Option<NewTypes>, Error> {
        let first_sql = unit.sql.first().cloned().unwrap_or_default();
        self.check_fail(&first_sql)?;
        self.log
            .lock()
            .ddl
            .push(unit.ddl_stmt_id.clone().unwrap_or_default());
        Ok(None)
    }

    async fn sync(&mut self) -> Result<(), Error> {
        self.log.lock().syncs += 1;
        Ok(())
    }

    async fn force_error(&mut self) {
        self.log.lock().forced_errors += 1;
    }

    async fn user_schema_json(&mut self) -> Result<Bytes, Error> {
        Ok(self.script.user_schema_json.clone())
    }

    async fn global_schema_json(&mut self) -> Result<Bytes, Error> {
        Ok(self.script.global_schema_json.clone())
    }

    async fn db_config_json(&mut self, _include_secrets: bool) -> Result<Bytes, Error> {
        Ok(self.script.db_config_json.clone())
    }

    async fn dump(
        &mut self,
        _blocks: Vec<crate::compiler::DumpBlockDesc>,
        output: mpsc::Sender<DumpChunk>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<(), Error> {
        for (block_index, block_num, data) in self.script.dump_chunks.iter() {
            if cancelled.load(Ordering::Relaxed) {
                return Err(Error::aborted("dump cancelled"));
            }
            let chunk = DumpChunk {
                block_index: *block_index,
                block_num: *block_num,
                data: data.clone(),
            };
            if output.send(chunk).await.is_err() {
                return Err(Error::aborted("dump consumer went away"));
            }
        }
        Ok(())
    }

    async fn restore(
        &mut self,
        block: &crate::compiler::RestoreBlockDesc,
        data: &[u8],
        type_id_map: &HashMap<Uuid, u32>,
    ) -> Result<(), Error> {
        self.log.lock().restore_calls.push((
            block.schema_object_id,
            data.to_vec(),
            type_id_map.clone(),
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockCompiler {
    /// Compiled results keyed by source text.
    pub programs: Mutex<HashMap<String, CompiledQuery>>,
    pub compile_count: AtomicUsize,
    pub dump_descriptor: Mutex<Option<DumpDescriptor>>,
    pub restore_descriptor: Mutex<Option<RestoreDescriptor>>,
}

impl MockCompiler {
    pub fn program(&self, source: &str, compiled: CompiledQuery) {
        self.programs.lock().insert(source.to_string(), compiled);
    }

    pub fn compiles(&self) -> usize {
        self.compile_count.load(Ordering::Relaxed)
    }
}

impl CompilerPool for MockCompiler {
    async fn compile(
        &self,
        _dbname: &str,
        req: &QueryRequestInfo,
    ) -> Result<CompiledQuery, Error> {
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        self.programs
            .lock()
            .get(&req.source)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Query, format!("unknown query {:?}", req.source)))
    }

    async fn describe_database_dump(
        &self,
        _user_schema_json: &[u8],
        _global_schema_json: &[u8],
        _db_config_json: &[u8],
        _protocol_version: ProtocolVersion,
    ) -> Result<DumpDescriptor, Error> {
        self.dump_descriptor
            .lock()
            .clone()
            .ok_or_else(|| Error::internal("no dump descriptor scripted"))
    }

    async fn describe_database_restore(
        &self,
        _header: &DumpRestoreHeader,
    ) -> Result<RestoreDescriptor, Error> {
        self.restore_descriptor
            .lock()
            .clone()
            .ok_or_else(|| Error::internal("no restore descriptor scripted"))
    }

    async fn analyze_explain_output(
        &self,
        _req: &QueryRequestInfo,
        data: &[u8],
    ) -> Result<Bytes, Error> {
        let mut out = b"analyzed:".to_vec();
        out.extend_from_slice(data);
        Ok(Bytes::from(out))
    }

    async fn interpret_backend_error(&self, fields: &BackendErrorFields) -> Result<Error, Error> {
        Ok(Error::new(
            ErrorKind::Execution,
            format!("interpreted: {}", fields.message),
        ))
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ViewState {
    pub in_tx: bool,
    pub tx_error: bool,
    pub state_type_id: Uuid,
    pub state_data: Bytes,
    pub has_serializer: bool,
    pub compiled_cache: HashMap<QueryRequestInfo, CompiledQuery>,
    pub applied_config_ops: Vec<ConfigOp>,
    pub side_effects: Vec<SideEffect>,
    pub started: Vec<String>,
    pub succeeded: Vec<String>,
    pub errors: usize,
    pub aborted_txs: usize,
    pub committed_implicit: usize,
    pub backend_type_ids: HashMap<Uuid, u32>,
    /// Type ids the view accepts from `decode_state` besides its own.
    pub accept_nil_state: bool,
}

pub struct MockView {
    pub state: Arc<Mutex<ViewState>>,
}

impl DatabaseConnectionView for MockView {
    fn db_name(&self) -> &str {
        "main"
    }

    fn in_tx(&self) -> bool {
        self.state.lock().in_tx
    }

    fn in_tx_error(&self) -> bool {
        self.state.lock().tx_error
    }

    fn mark_tx_error(&mut self) {
        let mut state = self.state.lock();
        if state.in_tx {
            state.tx_error = true;
        }
    }

    fn clear_tx_error(&mut self) {
        self.state.lock().tx_error = false;
    }

    fn abort_tx(&mut self) {
        let mut state = self.state.lock();
        state.in_tx = false;
        state.tx_error = false;
        state.aborted_txs += 1;
    }

    fn rollback_tx_to_savepoint(&mut self, _name: &str) -> Result<(), Error> {
        self.state.lock().tx_error = false;
        Ok(())
    }

    fn serialize_state(&self) -> Bytes {
        self.state.lock().state_data.clone()
    }

    fn state_type_id(&self) -> Uuid {
        self.state.lock().state_type_id
    }

    fn state_type_desc(&self) -> Bytes {
        Bytes::from_static(b"state-desc")
    }

    fn decode_state(&mut self, type_id: Uuid, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock();
        if type_id == state.state_type_id || (type_id.is_nil() && state.accept_nil_state) {
            if !type_id.is_nil() {
                state.state_data = Bytes::copy_from_slice(data);
            }
            Ok(())
        } else {
            Err(Error::state_mismatch())
        }
    }

    fn has_state_serializer(&self) -> bool {
        self.state.lock().has_serializer
    }

    fn reload_state_serializer(&mut self) -> Result<(), Error> {
        self.state.lock().has_serializer = true;
        Ok(())
    }

    fn start(&mut self, unit: &QueryUnit) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.started.push(unit.status.clone());
        if unit.tx_id.is_some() {
            state.in_tx = true;
        }
        Ok(())
    }

    fn start_implicit(&mut self, unit: &QueryUnit) {
        let mut state = self.state.lock();
        state.started.push(unit.status.clone());
        state.in_tx = true;
    }

    fn on_success(&mut self, unit: &QueryUnit, _new_types: Option<&NewTypes>) {
        let mut state = self.state.lock();
        state.succeeded.push(unit.status.clone());
        if unit.tx_commit || unit.tx_rollback {
            state.in_tx = false;
        }
    }

    fn on_error(&mut self) {
        self.state.lock().errors += 1;
    }

    fn commit_implicit_tx(&mut self, _side_effects: &[SideEffect]) {
        let mut state = self.state.lock();
        state.in_tx = false;
        state.committed_implicit += 1;
    }

    fn lookup_compiled(&self, req: &QueryRequestInfo) -> Option<CompiledQuery> {
        self.state.lock().compiled_cache.get(req).cloned()
    }

    fn cache_compiled(&mut self, req: QueryRequestInfo, compiled: &CompiledQuery) {
        self.state.lock().compiled_cache.insert(req, compiled.clone());
    }

    fn apply_config_ops(&mut self, ops: &[ConfigOp]) -> Result<(), Error> {
        self.state.lock().applied_config_ops.extend(ops.iter().cloned());
        Ok(())
    }

    fn resolve_backend_type_id(&self, schema_type_id: Uuid) -> Result<u32, Error> {
        self.state
            .lock()
            .backend_type_ids
            .get(&schema_type_id)
            .copied()
            .ok_or_else(|| Error::internal(format!("unknown schema type {schema_type_id}")))
    }

    fn signal_side_effects(&mut self, effect: SideEffect) {
        self.state.lock().side_effects.push(effect);
    }
}

// ---------------------------------------------------------------------------
// Tenant
// ---------------------------------------------------------------------------

pub struct MockTenant {
    pub compiler: MockCompiler,
    pub backend_log: Arc<Mutex<BackendLog>>,
    pub backend_script: Arc<BackendScript>,
    pub view_state: Arc<Mutex<ViewState>>,
    pub readiness: Mutex<Readiness>,
    pub auth: Mutex<AuthPolicy>,
    pub jwt_ring: JwtKeyRing,
    pub introspections: AtomicUsize,
}

impl MockTenant {
    pub fn new() -> Self {
        let view_state = ViewState {
            has_serializer: true,
            accept_nil_state: true,
            state_type_id: Uuid::from_u128(0x5157),
            ..Default::default()
        };
        MockTenant {
            compiler: MockCompiler::default(),
            backend_log: Arc::new(Mutex::new(BackendLog::default())),
            backend_script: Arc::new(BackendScript::default()),
            view_state: Arc::new(Mutex::new(view_state)),
            readiness: Mutex::new(Readiness::Ready),
            auth: Mutex::new(AuthPolicy::Trust),
            jwt_ring: JwtKeyRing::new(),
            introspections: AtomicUsize::new(0),
        }
    }

    pub fn with_backend_script(mut self, script: BackendScript) -> Self {
        self.backend_script = Arc::new(script);
        self
    }

    pub fn with_auth(self, policy: AuthPolicy) -> Self {
        *self.auth.lock() = policy;
        self
    }

    pub fn with_jwt_ring(mut self, ring: JwtKeyRing) -> Self {
        self.jwt_ring = ring;
        self
    }
}

impl Tenant for MockTenant {
    type Backend = MockBackend;
    type View = MockView;
    type Compiler = MockCompiler;

    fn compiler(&self) -> &MockCompiler {
        &self.compiler
    }

    fn readiness(&self) -> Readiness {
        self.readiness.lock().clone()
    }

    fn instance_name(&self) -> &str {
        "test_instance"
    }

    fn tenant_prefix(&self) -> &str {
        "t1_"
    }

    fn server_version_string(&self) -> &str {
        "6.0-dev.1"
    }

    fn catalog_version(&self) -> i64 {
        2024_01_01_00_00
    }

    fn suggested_pool_concurrency(&self) -> usize {
        10
    }

    fn system_config_status(&self) -> Bytes {
        Bytes::from_static(b"{}")
    }

    fn dev_pgaddr(&self) -> Option<String> {
        None
    }

    async fn open_view(&self, _dbname: &str, _user: &str) -> Result<MockView, Error> {
        Ok(MockView {
            state: self.view_state.clone(),
        })
    }

    async fn acquire_backend(&self, _dbname: &str) -> Result<MockBackend, Error> {
        Ok(MockBackend {
            log: self.backend_log.clone(),
            script: self.backend_script.clone(),
        })
    }

    fn release_backend(&self, conn: MockBackend) {
        conn.log.lock().released += 1;
    }

    fn auth_policy(&self, _user: &str) -> Result<AuthPolicy, Error> {
        Ok(self.auth.lock().clone())
    }

    fn jwt_keys(&self) -> &JwtKeyRing {
        &self.jwt_ring
    }

    fn check_jwt(&self, _claims: &serde_json::Value) -> Result<(), Error> {
        Ok(())
    }

    async fn on_before_create_db_from_template(&self, _template: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn on_before_drop_db(&self, _dbname: &str, _current_db: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn on_system_config_change(&self) -> Result<(), Error> {
        Ok(())
    }

    fn trigger_introspection(&self, _dbname: &str) {
        self.introspections.fetch_add(1, Ordering::Relaxed);
    }
}

