//! The per-database connection view and its session-state adapter.
//!
//! The view is an external collaborator: it owns session configuration,
//! the transactional state machine and the compiled-query cache. The
//! engine talks to it through [`DatabaseConnectionView`] and wraps it in
//! [`SessionView`], which additionally tracks what state description the
//! client has last been told about.

use bytes::Bytes;
use uuid::Uuid;

use crate::backend::NewTypes;
use crate::compiler::{CompiledQuery, ConfigOp, QueryRequestInfo, QueryUnit};
use crate::errors::Error;
use crate::messages::constants::{TX_STATUS_IDLE, TX_STATUS_IN_FAILED_TX, TX_STATUS_IN_TX};

/// Side effects a successfully executed unit may have beyond its own
/// database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    SchemaChanges,
    DatabaseConfigChanges,
    InstanceConfigChanges,
    DatabaseChanges,
}

/// Side effects implied by a unit's role flags.
pub fn unit_side_effect(unit: &QueryUnit) -> Option<SideEffect> {
    if unit.ddl_stmt_id.is_some() {
        Some(SideEffect::SchemaChanges)
    } else if unit.create_db.is_some() || unit.drop_db.is_some() {
        Some(SideEffect::DatabaseChanges)
    } else if unit.system_config || unit.backend_config {
        Some(SideEffect::InstanceConfigChanges)
    } else if unit.database_config {
        Some(SideEffect::DatabaseConfigChanges)
    } else {
        None
    }
}

/// External per-database view.
pub trait DatabaseConnectionView: Send + 'static {
    fn db_name(&self) -> &str;

    // Transactional state machine.
    fn in_tx(&self) -> bool;
    fn in_tx_error(&self) -> bool;
    fn mark_tx_error(&mut self);
    fn clear_tx_error(&mut self);
    fn abort_tx(&mut self);
    fn rollback_tx_to_savepoint(&mut self, name: &str) -> Result<(), Error>;

    // Session state.
    fn serialize_state(&self) -> Bytes;
    fn state_type_id(&self) -> Uuid;
    fn state_type_desc(&self) -> Bytes;
    /// Fails with `StateMismatchError` when `type_id` is not the current
    /// state shape.
    fn decode_state(&mut self, type_id: Uuid, data: &[u8]) -> Result<(), Error>;
    fn has_state_serializer(&self) -> bool;
    fn reload_state_serializer(&mut self) -> Result<(), Error>;

    // Unit lifecycle.
    fn start(&mut self, unit: &QueryUnit) -> Result<(), Error>;
    fn start_implicit(&mut self, unit: &QueryUnit);
    fn on_success(&mut self, unit: &QueryUnit, new_types: Option<&NewTypes>);
    fn on_error(&mut self);
    fn commit_implicit_tx(&mut self, side_effects: &[SideEffect]);

    // Compiled-query cache.
    fn lookup_compiled(&self, req: &QueryRequestInfo) -> Option<CompiledQuery>;
    fn cache_compiled(&mut self, req: QueryRequestInfo, compiled: &CompiledQuery);

    // Config and schema services.
    fn apply_config_ops(&mut self, ops: &[ConfigOp]) -> Result<(), Error>;
    fn resolve_backend_type_id(&self, schema_type_id: Uuid) -> Result<u32, Error>;
    fn signal_side_effects(&mut self, effect: SideEffect);
}

/// Thin wrapper the connection owns for its lifetime.
pub struct SessionView<V> {
    pub inner: V,
    /// State-description type id last announced to the client with an `s`
    /// frame; a fresh `s` is emitted only when this changes.
    last_sent_state_desc: Option<Uuid>,
}

impl<V: DatabaseConnectionView> SessionView<V> {
    pub fn new(inner: V) -> Self {
        SessionView {
            inner,
            last_sent_state_desc: None,
        }
    }

    /// Transaction status byte for the `Z` frame. Derived from the view,
    /// not the backend: a compile-time error can desync the two.
    pub fn tx_status(&self) -> u8 {
        if self.inner.in_tx_error() {
            TX_STATUS_IN_FAILED_TX
        } else if self.inner.in_tx() {
            TX_STATUS_IN_TX
        } else {
            TX_STATUS_IDLE
        }
    }

    /// Record that the current state description was sent to the client.
    pub fn mark_state_desc_sent(&mut self) {
        self.last_sent_state_desc = Some(self.inner.state_type_id());
    }

    /// True when the state description changed since the last `s` frame.
    pub fn state_desc_changed(&self) -> bool {
        self.last_sent_state_desc != Some(self.inner.state_type_id())
    }
}
