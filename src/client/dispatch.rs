//! The request dispatcher: one loop owning the connection, routing each
//! message by type and funnelling every failure through interpretation and
//! the drain-to-Sync recovery mode.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::compiler::CompilerPool;
use crate::errors::{
    static_interpret_backend_error, Error, ErrorKind, Interpreted, InterpretContext,
};
use crate::messages::codec::Incoming;
use crate::messages::constants::*;
use crate::messages::server;
use crate::tenant::Tenant;
use crate::view::DatabaseConnectionView;

use super::core::{ConnStatus, Connection};

impl<S, W, T> Connection<S, W, T>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Tenant,
{
    /// Main loop. Returns when the peer terminates, the connection dies,
    /// or the tenant goes offline.
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            self.flush().await?;

            let msg = match self.read_next().await {
                Ok(msg) => msg,
                Err(err) => match err.kind {
                    // Peer closed the socket between requests.
                    ErrorKind::ConnectionAborted => return Ok(()),
                    ErrorKind::IdleSessionTimeout => {
                        server::error_response(&mut self.out, &err);
                        let _ = self.flush().await;
                        self.status = ConnStatus::Bad;
                        return Err(err);
                    }
                    _ => {
                        self.status = ConnStatus::Bad;
                        return Err(err);
                    }
                },
            };

            // Readiness gates every top-level action.
            if let Err(err) = self.tenant.check_readiness() {
                server::error_response(&mut self.out, &err);
                server::ready_for_command(&mut self.out, self.view.tx_status());
                let _ = self.flush().await;
                self.status = ConnStatus::Bad;
                return Err(err);
            }

            let mtype = msg.mtype();
            let result = match mtype {
                MSG_PARSE => self.handle_parse(msg).await,
                MSG_EXECUTE => self.handle_execute(msg).await,
                MSG_SYNC => {
                    // Sync carries no payload the server cares about.
                    server::ready_for_command(&mut self.out, self.view.tx_status());
                    self.flush().await
                }
                MSG_FLUSH => self.flush().await,
                MSG_TERMINATE => {
                    debug!("client sent Terminate");
                    return Ok(());
                }
                MSG_DUMP => self.handle_dump(msg).await,
                MSG_RESTORE => self.handle_restore(msg).await,
                MSG_LEGACY_DESCRIBE | MSG_LEGACY_EXECUTE | MSG_LEGACY_EXECUTE_SCRIPT => {
                    Err(Error::binary_protocol(format!(
                        "legacy protocol message '{}' is not supported; please upgrade the client",
                        mtype as char
                    )))
                }
                other => Err(Error::binary_protocol(format!(
                    "unexpected message '{}'",
                    other as char
                ))),
            };

            if let Err(err) = result {
                self.handle_dispatch_error(err).await?;
            }
        }
    }

    async fn read_next(&mut self) -> Result<Incoming, Error> {
        match self.config.idle_session_timeout_secs {
            Some(secs) if !self.in_dump_restore => {
                match tokio::time::timeout(
                    Duration::from_secs(secs),
                    self.reader.wait_for_message(),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::new(
                        ErrorKind::IdleSessionTimeout,
                        "closing the connection due to idling",
                    )),
                }
            }
            _ => self.reader.wait_for_message().await,
        }
    }

    /// Error path of the main loop: mark the view, interpret, emit `E`,
    /// then either drain to Sync or close.
    async fn handle_dispatch_error(&mut self, err: Error) -> Result<(), Error> {
        let locally_cancelled = self.check_cancelled().is_err();

        // Genuine transport failures: the socket is unusable, nothing can
        // be surfaced to the peer. An aborted read that we did not cause
        // ourselves means the peer is already gone.
        if matches!(err.kind, ErrorKind::Io)
            || (err.kind == ErrorKind::ConnectionAborted && !locally_cancelled)
        {
            self.status = ConnStatus::Bad;
            return Err(err);
        }

        // A backend-cancel echo is only a cancellation if we asked for
        // one; a query cancel can have other causes.
        let err = if err.is_backend_cancellation() && locally_cancelled {
            Error::aborted("query cancelled")
        } else {
            err
        };

        self.view.inner.mark_tx_error();
        let err = self.interpret_error(err).await;
        warn!(code = err.code(), "request failed: {}", err.message);
        server::error_response(&mut self.out, &err);

        if err.is_recoverable() {
            self.flush().await?;
            self.recover_from_error().await
        } else {
            // Cancellation and the readiness gates surface the error and a
            // final ready frame, then close.
            server::ready_for_command(&mut self.out, self.view.tx_status());
            let _ = self.flush().await;
            self.status = ConnStatus::Bad;
            Err(err)
        }
    }

    /// Recover-from-error sub-mode: discard everything until the next
    /// Sync, then report ready. Sync is the only message accepted here;
    /// everything else, Terminate included, is discarded.
    async fn recover_from_error(&mut self) -> Result<(), Error> {
        loop {
            let msg = self.reader.wait_for_message().await?;
            match msg.mtype() {
                MSG_SYNC => {
                    server::ready_for_command(&mut self.out, self.view.tx_status());
                    return self.flush().await;
                }
                other => {
                    debug!("discarding '{}' while recovering from error", other as char);
                }
            }
        }
    }

    /// Route a backend error through the interpretation pipeline: static
    /// mapping first, the compiler pool for schema-aware messages, and the
    /// tenant-prefix rewrite.
    pub(crate) async fn interpret_error(&self, err: Error) -> Error {
        let Some(fields) = err.backend.clone() else {
            return err;
        };
        let tenant = self.tenant.clone();
        let interpreted = match static_interpret_backend_error(&fields) {
            Interpreted::Error(err) => err,
            Interpreted::SchemaRequired => {
                match tenant.compiler().interpret_backend_error(&fields).await {
                    Ok(err) => err,
                    Err(err) => err,
                }
            }
        };
        interpreted.strip_tenant_prefix(&InterpretContext {
            tenant_prefix: tenant.tenant_prefix(),
        })
    }
}
