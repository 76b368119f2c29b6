//! Per-connection state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::compiler::CompiledQuery;
use crate::config::FrontendConfig;
use crate::errors::Error;
use crate::messages::codec::{FrameReader, MessageWriter, ProtocolVersion};
use crate::tenant::Tenant;
use crate::view::SessionView;

/// How the peer reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain stream socket speaking the binary protocol end to end.
    Stream,
    /// Tunnelled request: the outer layer already carried the connection
    /// parameters and auth data, so no ClientHandshake is expected.
    Tunnelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    New,
    Started,
    Bad,
}

/// One authenticated client connection. Created by
/// [`Connection::startup`]; driven by [`Connection::run`].
///
/// A single task owns the connection and all its buffers; none of the
/// mutable state here needs a lock.
pub struct Connection<S, W, T: Tenant> {
    pub(crate) reader: FrameReader<S>,
    pub(crate) stream: W,
    pub(crate) out: MessageWriter,

    pub(crate) tenant: Arc<T>,
    pub(crate) config: Arc<FrontendConfig>,

    pub(crate) transport: TransportKind,
    pub(crate) proto: ProtocolVersion,
    pub(crate) params: HashMap<String, String>,
    pub(crate) user: String,
    pub(crate) dbname: String,
    pub(crate) status: ConnStatus,

    pub(crate) view: SessionView<T::View>,

    /// Single-slot cache for the most recent anonymous compilation,
    /// keyed by the request fingerprint hash. Cleared on Execute after
    /// lookup.
    pub(crate) last_anon_compiled: Option<(u64, CompiledQuery)>,

    /// Set externally to cancel whatever the connection is doing; checked
    /// before backend calls and inside the dump loop.
    pub(crate) cancelled: Arc<AtomicBool>,

    pub(crate) in_dump_restore: bool,

    /// Test hook: compilations requested by this connection.
    #[cfg(test)]
    pub(crate) compile_count: usize,
}

impl<S, W, T> Connection<S, W, T>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Tenant,
{
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.proto
    }

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Connection parameter as sent by the client (or the tunnel).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Handle other tasks may use to cancel this connection.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(Error::aborted("the connection was cancelled"));
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        self.out.flush_to(&mut self.stream).await
    }

    /// Flush only when the buffered output passed the high-water mark.
    pub(crate) async fn maybe_flush(&mut self) -> Result<(), Error> {
        if self.out.len() >= self.config.write_high_water {
            self.flush().await?;
        }
        Ok(())
    }
}
