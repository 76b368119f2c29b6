//! The tenant: the server-side context a connection runs in.
//!
//! The tenant owns backend pools, per-database views, auth material and the
//! readiness gate. Connections refer to it by shared reference; nothing in
//! here points back at a connection object.

use std::future::Future;

use bytes::Bytes;

use crate::auth::jwt::JwtKeyRing;
use crate::auth::scram::ScramVerifier;
use crate::backend::BackendConnection;
use crate::compiler::CompilerPool;
use crate::errors::{Error, ErrorKind};
use crate::view::DatabaseConnectionView;

/// Tenant readiness as consulted before every top-level action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Administratively blocked; connections are refused with the reason.
    Blocked(String),
    /// Shutting down or failed over.
    Offline(String),
}

/// How a given user must authenticate.
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    Scram(ScramVerifier),
    Jwt,
    Trust,
}

pub trait Tenant: Send + Sync + 'static {
    type Backend: BackendConnection;
    type View: DatabaseConnectionView;
    type Compiler: CompilerPool;

    fn compiler(&self) -> &Self::Compiler;

    fn readiness(&self) -> Readiness;

    /// Map readiness to the error surfaced to the client.
    fn check_readiness(&self) -> Result<(), Error> {
        match self.readiness() {
            Readiness::Ready => Ok(()),
            Readiness::Blocked(reason) => Err(Error::new(
                ErrorKind::ServerBlocked,
                format!("the server is not accepting requests: {reason}"),
            )),
            Readiness::Offline(reason) => Err(Error::new(
                ErrorKind::ServerOffline,
                format!("the server is going offline: {reason}"),
            )),
        }
    }

    fn instance_name(&self) -> &str;

    /// Prefix namespacing this tenant's physical databases on the backend;
    /// stripped from backend error messages.
    fn tenant_prefix(&self) -> &str;

    fn server_version_string(&self) -> &str;
    fn catalog_version(&self) -> i64;
    fn suggested_pool_concurrency(&self) -> usize;

    /// Encoded value of the `system_config` status announced after auth.
    fn system_config_status(&self) -> Bytes;

    /// Backend address for the `pgaddr` dev-mode status, passwords already
    /// redacted. `None` outside dev mode.
    fn dev_pgaddr(&self) -> Option<String>;

    /// Open the per-database view for an authenticated connection. Fails
    /// with `AccessError` when the database does not accept connections.
    fn open_view(
        &self,
        dbname: &str,
        user: &str,
    ) -> impl Future<Output = Result<Self::View, Error>> + Send;

    fn acquire_backend(
        &self,
        dbname: &str,
    ) -> impl Future<Output = Result<Self::Backend, Error>> + Send;

    fn release_backend(&self, conn: Self::Backend);

    fn auth_policy(&self, user: &str) -> Result<AuthPolicy, Error>;

    fn jwt_keys(&self) -> &JwtKeyRing;

    /// Tenant-level hook over validated claims (key rotation, revocation).
    fn check_jwt(&self, claims: &serde_json::Value) -> Result<(), Error>;

    // Lifecycle hooks dispatched by the execute engine.
    fn on_before_create_db_from_template(
        &self,
        template: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn on_before_drop_db(
        &self,
        dbname: &str,
        current_db: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Pre-hook run before a system-config unit executes.
    fn on_system_config_change(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Kick an asynchronous re-introspection of a database (after restore).
    fn trigger_introspection(&self, dbname: &str);
}
