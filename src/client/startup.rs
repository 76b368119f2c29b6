//! Connection startup: handshake, version negotiation, authentication and
//! the post-auth status sequence.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::auth;
use crate::config::FrontendConfig;
use crate::errors::Error;
use crate::messages::codec::{
    FrameReader, MessageWriter, ProtocolVersion, PROTO_VER_CURRENT, PROTO_VER_MIN,
};
use crate::messages::constants::MSG_CLIENT_HANDSHAKE;
use crate::messages::server;
use crate::tenant::{AuthPolicy, Tenant};
use crate::view::{DatabaseConnectionView, SessionView};

use super::core::{ConnStatus, Connection, TransportKind};

/// Pick the version actually spoken: offers outside the served range are
/// clamped to the nearest bound, and legacy majors are only spoken at the
/// exact MIN feature level. Negotiation never fails the connection.
pub(crate) fn negotiate_version(offered: ProtocolVersion) -> ProtocolVersion {
    if offered < PROTO_VER_MIN {
        PROTO_VER_MIN
    } else if offered > PROTO_VER_CURRENT {
        PROTO_VER_CURRENT
    } else if offered.major < PROTO_VER_CURRENT.major && offered != PROTO_VER_MIN {
        PROTO_VER_MIN
    } else {
        offered
    }
}

impl<S, W, T> Connection<S, W, T>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Tenant,
{
    /// Accept a new peer: run the handshake and authentication, emit the
    /// post-auth status sequence, and return the started connection.
    ///
    /// On failure the error is surfaced to the peer as an `E` frame before
    /// being returned; the connection is then unusable.
    pub async fn startup(
        read_stream: S,
        write_stream: W,
        tenant: Arc<T>,
        config: Arc<FrontendConfig>,
        transport: TransportKind,
        tunnel_params: HashMap<String, String>,
        auth_data: Option<String>,
    ) -> Result<Self, Error> {
        let mut reader = FrameReader::new(read_stream);
        let mut stream = write_stream;
        let mut out = MessageWriter::new();

        let started = Self::startup_inner(
            &mut reader,
            &mut stream,
            &mut out,
            &tenant,
            &config,
            transport,
            tunnel_params,
            auth_data.as_deref(),
        )
        .await;

        match started {
            Ok((proto, params, user, dbname, view)) => {
                info!(user = %user, database = %dbname, proto = %proto, "client authenticated");
                Ok(Connection {
                    reader,
                    stream,
                    out,
                    tenant,
                    config,
                    transport,
                    proto,
                    params,
                    user,
                    dbname,
                    status: ConnStatus::Started,
                    view,
                    last_anon_compiled: None,
                    cancelled: Arc::new(AtomicBool::new(false)),
                    in_dump_restore: false,
                    #[cfg(test)]
                    compile_count: 0,
                })
            }
            Err(err) => {
                debug!(error = %err, "client startup failed");
                server::error_response(&mut out, &err);
                let _ = out.flush_to(&mut stream).await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments, clippy::type_complexity)]
    async fn startup_inner(
        reader: &mut FrameReader<S>,
        stream: &mut W,
        out: &mut MessageWriter,
        tenant: &Arc<T>,
        config: &Arc<FrontendConfig>,
        transport: TransportKind,
        tunnel_params: HashMap<String, String>,
        auth_data: Option<&str>,
    ) -> Result<
        (
            ProtocolVersion,
            HashMap<String, String>,
            String,
            String,
            SessionView<T::View>,
        ),
        Error,
    > {
        tenant.check_readiness()?;

        let (proto, params) = match transport {
            TransportKind::Stream => {
                let mut msg = reader.wait_for_message().await?;
                if msg.mtype() != MSG_CLIENT_HANDSHAKE {
                    return Err(Error::binary_protocol(format!(
                        "expected ClientHandshake, got '{}'",
                        msg.mtype() as char
                    )));
                }
                let major = msg.get_u16()?;
                let minor = msg.get_u16()?;
                let nparams = msg.get_u16()?;
                let mut params = HashMap::with_capacity(nparams as usize);
                for _ in 0..nparams {
                    let key = msg.get_utf8()?;
                    let value = msg.get_utf8()?;
                    params.insert(key, value);
                }
                let reserved = msg.get_u16()?;
                if reserved != 0 {
                    return Err(Error::binary_protocol(
                        "reserved field in ClientHandshake must be zero",
                    ));
                }
                msg.finish()?;

                let offered = ProtocolVersion::new(major, minor);
                let negotiated = negotiate_version(offered);
                if negotiated != offered {
                    debug!(%offered, %negotiated, "negotiating protocol version");
                    server::negotiate_protocol_version(out, negotiated);
                    out.flush_to(stream).await?;
                }
                (negotiated, params)
            }
            // The outer request already carried the parameters.
            TransportKind::Tunnelled => (PROTO_VER_CURRENT, tunnel_params),
        };

        let user = params
            .get("user")
            .cloned()
            .ok_or_else(|| Error::binary_protocol("missing required connection parameter \"user\""))?;
        let dbname = params.get("database").cloned().ok_or_else(|| {
            Error::binary_protocol("missing required connection parameter \"database\"")
        })?;

        match tenant.auth_policy(&user)? {
            AuthPolicy::Scram(verifier) => {
                auth::authenticate_sasl(reader, out, stream, verifier).await?;
            }
            AuthPolicy::Jwt => {
                auth::authenticate_jwt(
                    tenant.as_ref(),
                    auth_data,
                    params.get("secret_key").map(String::as_str),
                    &user,
                    &dbname,
                )?;
            }
            AuthPolicy::Trust => {}
        }

        let view = tenant.open_view(&dbname, &user).await?;
        let mut view = SessionView::new(view);

        server::auth_ok(out);
        server::server_key_data(out);
        server::state_description(out, view.inner.state_type_id(), &view.inner.state_type_desc());
        view.mark_state_desc_sent();
        if config.dev_mode {
            if let Some(pgaddr) = tenant.dev_pgaddr() {
                server::server_status(out, "pgaddr", pgaddr.as_bytes());
            }
        }
        server::server_status(
            out,
            "suggested_pool_concurrency",
            tenant.suggested_pool_concurrency().to_string().as_bytes(),
        );
        server::server_status(out, "system_config", &tenant.system_config_status());
        server::ready_for_command(out, view.tx_status());
        out.flush_to(stream).await?;

        Ok((proto, params, user, dbname, view))
    }
}
