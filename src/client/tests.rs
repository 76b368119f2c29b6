//! End-to-end connection tests over an in-memory duplex socket, with all
//! collaborators mocked.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::BatchFence;
use crate::compiler::{
    capability, Cardinality, CompiledQuery, DataMendingDesc, DumpBlockDesc, DumpDescriptor,
    DumpTypeInfo, QueryUnit, QueryUnitGroup, RestoreBlockDesc, RestoreDescriptor,
};
use crate::config::FrontendConfig;
use crate::errors::{Error, ErrorKind};
use crate::messages::codec::{Incoming, MessageBuffer, MessageWriter};
use crate::messages::constants::*;
use crate::tenant::AuthPolicy;
use crate::view::SideEffect;

use super::core::{Connection, TransportKind};
use super::mocks::*;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestClient {
    stream: DuplexStream,
    inbound: MessageBuffer,
}

impl TestClient {
    async fn recv(&mut self) -> Incoming {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(msg) = self.inbound.take_message().unwrap() {
                return msg;
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection unexpectedly");
            self.inbound.feed(&buf[..n]);
        }
    }

    /// Read frames until one of type `mtype` arrives, returning it.
    async fn recv_until(&mut self, mtype: u8) -> Incoming {
        loop {
            let msg = self.recv().await;
            if msg.mtype() == mtype {
                return msg;
            }
        }
    }

    async fn send(&mut self, build: impl FnOnce(&mut MessageWriter)) {
        let mut w = MessageWriter::new();
        build(&mut w);
        self.stream.write_all(&w.take()).await.unwrap();
    }

    async fn send_handshake(&mut self, major: u16, minor: u16, params: &[(&str, &str)]) {
        self.send(|w| {
            w.begin(MSG_CLIENT_HANDSHAKE);
            w.put_u16(major);
            w.put_u16(minor);
            w.put_u16(params.len() as u16);
            for (key, value) in params {
                w.put_utf8(key);
                w.put_utf8(value);
            }
            w.put_u16(0);
            w.end_message();
        })
        .await;
    }

    async fn send_parse(&mut self, source: &str, allow_capabilities: u64) {
        self.send(|w| {
            w.begin(MSG_PARSE);
            put_request_prefix(w, source, allow_capabilities, 0, FORMAT_BINARY);
            w.end_message();
        })
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_execute(
        &mut self,
        source: &str,
        allow_capabilities: u64,
        in_tid: Uuid,
        out_tid: Uuid,
    ) {
        self.send(|w| {
            w.begin(MSG_EXECUTE);
            put_request_prefix(w, source, allow_capabilities, 0, FORMAT_BINARY);
            w.put_uuid(in_tid);
            w.put_uuid(out_tid);
            w.put_len_bytes(&[]);
            w.end_message();
        })
        .await;
    }

    async fn send_sync(&mut self) {
        self.send(|w| {
            w.begin(MSG_SYNC);
            w.end_message();
        })
        .await;
    }
}

fn put_request_prefix(
    w: &mut MessageWriter,
    source: &str,
    allow_capabilities: u64,
    implicit_limit: i64,
    format: u8,
) {
    w.put_u16(0); // annotations
    w.put_u64(allow_capabilities);
    w.put_u64(0); // compilation flags
    w.put_i64(implicit_limit);
    w.put_u8(format);
    w.put_u8(CARDINALITY_MANY);
    w.put_utf8(source);
    w.put_uuid(Uuid::nil()); // state type id: the zero state
    w.put_len_bytes(&[]);
}

fn decode_error(mut msg: Incoming) -> (u8, u32, String) {
    assert_eq!(msg.mtype(), MSG_ERROR_RESPONSE);
    let severity = msg.get_u8().unwrap();
    let code = msg.get_i32().unwrap() as u32;
    let message = msg.get_utf8().unwrap();
    (severity, code, message)
}

/// Spawn a connection against the tenant and complete the handshake.
async fn start_connection(
    tenant: Arc<MockTenant>,
) -> (TestClient, JoinHandle<Result<(), Error>>, Vec<u8>) {
    let (client_side, server_side) = tokio::io::duplex(1 << 20);
    let (read_half, write_half) = tokio::io::split(server_side);
    let handle = tokio::spawn(async move {
        let conn = Connection::startup(
            read_half,
            write_half,
            tenant,
            Arc::new(FrontendConfig::default()),
            TransportKind::Stream,
            HashMap::new(),
            None,
        )
        .await?;
        conn.run().await
    });

    let mut client = TestClient {
        stream: client_side,
        inbound: MessageBuffer::new(),
    };
    client
        .send_handshake(1, 0, &[("user", "edgedb"), ("database", "main")])
        .await;

    let mut startup_frames = Vec::new();
    loop {
        let msg = client.recv().await;
        startup_frames.push(msg.mtype());
        if msg.mtype() == MSG_READY_FOR_COMMAND {
            break;
        }
    }
    (client, handle, startup_frames)
}

fn single_unit_query(status: &str, sql: &str) -> CompiledQuery {
    let unit = QueryUnit {
        sql: vec![sql.to_string()],
        status: status.to_string(),
        cardinality: Cardinality::Many,
        capabilities: 0,
        cacheable: true,
        in_type_id: Uuid::from_u128(0x11),
        in_type_data: Bytes::from_static(b"in-desc"),
        out_type_id: Uuid::from_u128(0x22),
        out_type_data: Bytes::from_static(b"out-desc"),
        ..Default::default()
    };
    CompiledQuery::new(QueryUnitGroup {
        units: vec![unit],
        cardinality: Cardinality::Many,
    })
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_startup_sequence_after_auth() {
    let tenant = Arc::new(MockTenant::new());
    let (_client, handle, frames) = start_connection(tenant).await;
    // R (auth ok), K, s, S suggested_pool_concurrency, S system_config, Z.
    assert_eq!(
        frames,
        vec![
            MSG_AUTHENTICATION,
            MSG_SERVER_KEY_DATA,
            MSG_STATE_DESCRIPTION,
            MSG_SERVER_STATUS,
            MSG_SERVER_STATUS,
            MSG_READY_FOR_COMMAND
        ]
    );
    handle.abort();
}

#[tokio::test]
async fn test_handshake_negotiates_down_and_demands_params() {
    let tenant = Arc::new(MockTenant::new());
    let (client_side, server_side) = tokio::io::duplex(1 << 16);
    let (read_half, write_half) = tokio::io::split(server_side);
    let handle = tokio::spawn(async move {
        Connection::startup(
            read_half,
            write_half,
            tenant,
            Arc::new(FrontendConfig::default()),
            TransportKind::Stream,
            HashMap::new(),
            None,
        )
        .await
        .map(|_| ())
    });

    let mut client = TestClient {
        stream: client_side,
        inbound: MessageBuffer::new(),
    };
    // v0.14 with no parameters at all.
    client.send_handshake(0, 14, &[]).await;

    let mut msg = client.recv().await;
    assert_eq!(msg.mtype(), MSG_NEGOTIATE_PROTOCOL);
    assert_eq!(msg.get_u16().unwrap(), 0);
    assert_eq!(msg.get_u16().unwrap(), 13);
    assert_eq!(msg.get_u16().unwrap(), 0);
    msg.finish().unwrap();

    let (_, code, message) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::BinaryProtocol.code());
    assert!(message.contains("user"));
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn test_handshake_reserved_field_must_be_zero() {
    let tenant = Arc::new(MockTenant::new());
    let (client_side, server_side) = tokio::io::duplex(1 << 16);
    let (read_half, write_half) = tokio::io::split(server_side);
    let handle = tokio::spawn(async move {
        Connection::startup(
            read_half,
            write_half,
            tenant,
            Arc::new(FrontendConfig::default()),
            TransportKind::Stream,
            HashMap::new(),
            None,
        )
        .await
        .map(|_| ())
    });

    let mut client = TestClient {
        stream: client_side,
        inbound: MessageBuffer::new(),
    };
    client
        .send(|w| {
            w.begin(MSG_CLIENT_HANDSHAKE);
            w.put_u16(1);
            w.put_u16(0);
            w.put_u16(0);
            w.put_u16(7); // reserved must be zero
            w.end_message();
        })
        .await;

    let (_, code, _) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::BinaryProtocol.code());
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn test_jwt_scope_failure_names_the_database() {
    use jwt::{AlgorithmType, Header, PKeyWithDigest, SignWithKey, Token};
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    let rsa = Rsa::generate(2048).unwrap();
    let signer = PKeyWithDigest {
        digest: MessageDigest::sha256(),
        key: PKey::from_rsa(rsa.clone()).unwrap(),
    };
    let pub_pem = PKey::from_rsa(rsa).unwrap().public_key_to_pem().unwrap();
    let ring = crate::auth::jwt::JwtKeyRing::from_pem(&pub_pem).unwrap();

    let header = Header {
        algorithm: AlgorithmType::Rs256,
        ..Default::default()
    };
    let token = Token::new(header, serde_json::json!({"edb.d": ["other_db"]}))
        .sign_with_key(&signer)
        .unwrap()
        .as_str()
        .to_string();

    let tenant = Arc::new(
        MockTenant::new()
            .with_auth(AuthPolicy::Jwt)
            .with_jwt_ring(ring),
    );

    let (client_side, server_side) = tokio::io::duplex(1 << 16);
    let (read_half, write_half) = tokio::io::split(server_side);
    let handle = tokio::spawn(async move {
        Connection::startup(
            read_half,
            write_half,
            tenant,
            Arc::new(FrontendConfig::default()),
            TransportKind::Stream,
            HashMap::new(),
            None,
        )
        .await
        .map(|_| ())
    });

    let mut client = TestClient {
        stream: client_side,
        inbound: MessageBuffer::new(),
    };
    let secret_key = format!("nbwt1_{token}");
    client
        .send_handshake(
            1,
            0,
            &[
                ("user", "edgedb"),
                ("database", "main"),
                ("secret_key", &secret_key),
            ],
        )
        .await;

    let (severity, code, message) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::Authentication.code());
    assert_eq!(severity, crate::errors::SEVERITY_FATAL);
    assert!(message.contains("access to database \"main\""), "{message}");
    assert!(handle.await.unwrap().is_err());
}

// ---------------------------------------------------------------------------
// Parse / Execute
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parse_execute_fast_path_compiles_once() {
    let mut script = BackendScript::default();
    script.rows_by_sql.insert(
        "SELECT 1".to_string(),
        vec![Bytes::from_static(b"\x00\x00\x00\x01")],
    );
    let tenant = Arc::new(MockTenant::new().with_backend_script(script));
    tenant
        .compiler
        .program("select 1", single_unit_query("SELECT", "SELECT 1"));

    let (mut client, handle, _) = start_connection(tenant.clone()).await;

    client.send_parse("select 1", capability::ALL).await;
    let mut desc = client.recv().await;
    assert_eq!(desc.mtype(), MSG_COMMAND_DATA_DESCRIPTION);
    assert_eq!(desc.get_u16().unwrap(), 0);
    let _caps = desc.get_i64().unwrap();
    let _card = desc.get_u8().unwrap();
    let in_tid = desc.get_uuid().unwrap();
    assert_eq!(&desc.get_len_bytes().unwrap()[..], b"in-desc");
    let out_tid = desc.get_uuid().unwrap();
    assert_eq!(&desc.get_len_bytes().unwrap()[..], b"out-desc");
    desc.finish().unwrap();

    client
        .send_execute("select 1", capability::ALL, in_tid, out_tid)
        .await;
    let mut data = client.recv().await;
    assert_eq!(data.mtype(), MSG_DATA);
    assert_eq!(data.get_u16().unwrap(), 1);
    assert_eq!(&data.get_len_bytes().unwrap()[..], b"\x00\x00\x00\x01");

    let mut complete = client.recv().await;
    assert_eq!(complete.mtype(), MSG_COMMAND_COMPLETE);
    complete.get_u16().unwrap();
    complete.get_i64().unwrap();
    assert_eq!(&complete.get_len_bytes().unwrap()[..], b"SELECT");

    // One compile serves both Parse and Execute.
    assert_eq!(tenant.compiler.compiles(), 1);

    client.send_sync().await;
    let mut ready = client.recv().await;
    assert_eq!(ready.mtype(), MSG_READY_FOR_COMMAND);
    ready.get_u16().unwrap();
    assert_eq!(ready.get_u8().unwrap(), TX_STATUS_IDLE);

    handle.abort();
}

#[tokio::test]
async fn test_parameter_type_mismatch_resends_description() {
    let tenant = Arc::new(MockTenant::new());
    tenant
        .compiler
        .program("select <int64>$0", single_unit_query("SELECT", "SELECT $1"));

    let (mut client, handle, _) = start_connection(tenant).await;

    // All-zero expected input type id, but the compiled query has one.
    client
        .send_execute(
            "select <int64>$0",
            capability::ALL,
            Uuid::nil(),
            Uuid::from_u128(0x22),
        )
        .await;

    let desc = client.recv().await;
    assert_eq!(desc.mtype(), MSG_COMMAND_DATA_DESCRIPTION);
    let (_, code, _) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::ParameterTypeMismatch.code());

    client.send_sync().await;
    let mut ready = client.recv().await;
    assert_eq!(ready.mtype(), MSG_READY_FOR_COMMAND);
    ready.get_u16().unwrap();
    assert_eq!(ready.get_u8().unwrap(), TX_STATUS_IDLE);

    handle.abort();
}

#[tokio::test]
async fn test_disabled_capability_is_named() {
    let tenant = Arc::new(MockTenant::new());
    let mut compiled = single_unit_query("CREATE TYPE", "CREATE TABLE x ()");
    Arc::get_mut(&mut compiled.group).unwrap().units[0].capabilities = capability::DDL;
    tenant.compiler.program("create type X", compiled);

    let (mut client, handle, _) = start_connection(tenant).await;

    client
        .send_execute(
            "create type X",
            0, // nothing allowed
            Uuid::from_u128(0x11),
            Uuid::from_u128(0x22),
        )
        .await;

    let (_, code, message) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::DisabledCapability.code());
    assert!(message.contains("DDL"), "{message}");

    handle.abort();
}

#[tokio::test]
async fn test_error_recovery_discards_until_sync() {
    let tenant = Arc::new(MockTenant::new());
    let (mut client, handle, _) = start_connection(tenant).await;

    // Unknown source: the mock compiler fails it.
    client
        .send_execute("select nope", capability::ALL, Uuid::nil(), Uuid::nil())
        .await;
    let (_, code, _) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::Query.code());

    // Anything but Sync is discarded while recovering, Terminate included.
    client.send_parse("select 1", capability::ALL).await;
    client
        .send(|w| {
            w.begin(MSG_TERMINATE);
            w.end_message();
        })
        .await;
    client.send_sync().await;
    let msg = client.recv().await;
    assert_eq!(msg.mtype(), MSG_READY_FOR_COMMAND);

    handle.abort();
}

#[tokio::test]
async fn test_local_cancellation_surfaces_error_and_closes() {
    let tenant = Arc::new(MockTenant::new());
    tenant
        .compiler
        .program("select 1", single_unit_query("SELECT", "SELECT 1"));

    let (client_side, server_side) = tokio::io::duplex(1 << 16);
    let (read_half, write_half) = tokio::io::split(server_side);
    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        let conn = Connection::startup(
            read_half,
            write_half,
            tenant,
            Arc::new(FrontendConfig::default()),
            TransportKind::Stream,
            HashMap::new(),
            None,
        )
        .await?;
        let _ = cancel_tx.send(conn.cancel_handle());
        conn.run().await
    });

    let mut client = TestClient {
        stream: client_side,
        inbound: MessageBuffer::new(),
    };
    client
        .send_handshake(1, 0, &[("user", "edgedb"), ("database", "main")])
        .await;
    client.recv_until(MSG_READY_FOR_COMMAND).await;
    let cancelled = cancel_rx.await.unwrap();

    // Cancel, then issue a request: the engine notices the flag before
    // touching the backend and surfaces the abort as an `E` frame plus a
    // final ready frame before closing.
    cancelled.store(true, std::sync::atomic::Ordering::Relaxed);
    client
        .send_execute(
            "select 1",
            capability::ALL,
            Uuid::from_u128(0x11),
            Uuid::from_u128(0x22),
        )
        .await;

    let (_, code, message) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::ConnectionAborted.code());
    assert!(message.contains("cancelled"), "{message}");

    let mut ready = client.recv().await;
    assert_eq!(ready.mtype(), MSG_READY_FOR_COMMAND);
    ready.get_u16().unwrap();
    assert_eq!(ready.get_u8().unwrap(), TX_STATUS_IDLE);

    let result = handle.await.unwrap();
    assert_eq!(result.unwrap_err().kind, ErrorKind::ConnectionAborted);
}

#[tokio::test]
async fn test_boundary_violations_are_binary_protocol_errors() {
    let tenant = Arc::new(MockTenant::new());
    let (mut client, handle, _) = start_connection(tenant).await;

    // Empty query.
    client.send_parse("", capability::ALL).await;
    let (_, code, message) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::BinaryProtocol.code());
    assert!(message.contains("empty query"));
    client.send_sync().await;
    client.recv_until(MSG_READY_FOR_COMMAND).await;

    // Negative implicit limit.
    client
        .send(|w| {
            w.begin(MSG_PARSE);
            w.put_u16(0);
            w.put_u64(capability::ALL);
            w.put_u64(0);
            w.put_i64(-1);
            w.put_u8(FORMAT_BINARY);
            w.put_u8(CARDINALITY_MANY);
            w.put_utf8("select 1");
            w.put_uuid(Uuid::nil());
            w.put_len_bytes(&[]);
            w.end_message();
        })
        .await;
    let (_, code, _) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::BinaryProtocol.code());
    client.send_sync().await;
    client.recv_until(MSG_READY_FOR_COMMAND).await;

    // Unknown output format byte.
    client
        .send(|w| {
            w.begin(MSG_PARSE);
            w.put_u16(0);
            w.put_u64(capability::ALL);
            w.put_u64(0);
            w.put_i64(0);
            w.put_u8(b'z');
            w.put_u8(CARDINALITY_MANY);
            w.put_utf8("select 1");
            w.put_uuid(Uuid::nil());
            w.put_len_bytes(&[]);
            w.end_message();
        })
        .await;
    let (_, code, _) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::BinaryProtocol.code());
    client.send_sync().await;
    client.recv_until(MSG_READY_FOR_COMMAND).await;

    // Legacy message type.
    client
        .send(|w| {
            w.begin(MSG_LEGACY_EXECUTE_SCRIPT);
            w.put_utf8("select 1");
            w.end_message();
        })
        .await;
    let (_, code, message) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::BinaryProtocol.code());
    assert!(message.contains("legacy"));

    handle.abort();
}

#[tokio::test]
async fn test_state_is_elided_when_backend_holds_it() {
    let mut script = BackendScript::default();
    script
        .rows_by_sql
        .insert("SELECT 1".to_string(), vec![Bytes::from_static(b"x")]);
    let tenant = Arc::new(MockTenant::new().with_backend_script(script));
    tenant.view_state.lock().state_data = Bytes::from_static(b"stateblob");
    tenant
        .compiler
        .program("select 1", single_unit_query("SELECT", "SELECT 1"));

    let (mut client, handle, _) = start_connection(tenant.clone()).await;

    for _ in 0..2 {
        client
            .send_execute(
                "select 1",
                capability::ALL,
                Uuid::from_u128(0x11),
                Uuid::from_u128(0x22),
            )
            .await;
        client.recv_until(MSG_COMMAND_COMPLETE).await;
    }

    let log = tenant.backend_log.lock();
    assert_eq!(log.executes.len(), 2);
    assert_eq!(log.executes[0].state.as_deref(), Some(&b"stateblob"[..]));
    assert!(!log.executes[0].use_prep_stmt);
    // The backend's last_state matched on the second run: zero state bytes
    // were sent.
    assert_eq!(log.executes[1].state, None);
    drop(log);

    handle.abort();
}

#[tokio::test]
async fn test_script_with_readback_splits_the_pipeline() {
    let mut script = BackendScript::default();
    script.rows_by_sql.insert(
        "SET-GLOBAL-SQL".to_string(),
        vec![Bytes::from_static(b"\x01{\"name\":\"g\",\"value\":1}")],
    );
    script.rows_by_sql.insert(
        "SELECT-GLOBAL-SQL".to_string(),
        vec![Bytes::from_static(b"\x00\x00\x00\x01")],
    );
    let tenant = Arc::new(MockTenant::new().with_backend_script(script));

    let set_unit = QueryUnit {
        sql: vec!["SET-GLOBAL-SQL".to_string()],
        status: "SET GLOBAL".to_string(),
        needs_readback: true,
        cacheable: true,
        in_type_id: Uuid::from_u128(0x11),
        in_type_data: Bytes::from_static(b"in-desc"),
        out_type_id: Uuid::from_u128(0x33),
        out_type_data: Bytes::from_static(b"noout"),
        ..Default::default()
    };
    let select_unit = QueryUnit {
        sql: vec!["SELECT-GLOBAL-SQL".to_string()],
        status: "SELECT".to_string(),
        cacheable: true,
        in_type_id: Uuid::from_u128(0x11),
        in_type_data: Bytes::from_static(b"in-desc"),
        out_type_id: Uuid::from_u128(0x22),
        out_type_data: Bytes::from_static(b"out-desc"),
        ..Default::default()
    };
    tenant.compiler.program(
        "set global g := 1; select global g",
        CompiledQuery::new(QueryUnitGroup {
            units: vec![set_unit, select_unit],
            cardinality: Cardinality::Many,
        }),
    );

    let (mut client, handle, _) = start_connection(tenant.clone()).await;

    client
        .send_execute(
            "set global g := 1; select global g",
            capability::ALL,
            Uuid::from_u128(0x11),
            Uuid::from_u128(0x22),
        )
        .await;

    let data = client.recv_until(MSG_DATA).await;
    drop(data);
    let mut complete = client.recv_until(MSG_COMMAND_COMPLETE).await;
    complete.get_u16().unwrap();
    complete.get_i64().unwrap();
    // The group's status is the trailing unit's.
    assert_eq!(&complete.get_len_bytes().unwrap()[..], b"SELECT");

    let view = tenant.view_state.lock();
    assert_eq!(view.applied_config_ops.len(), 1);
    assert_eq!(view.applied_config_ops[0].setting_name(), Some("g"));
    assert_eq!(view.committed_implicit, 1);
    assert_eq!(view.started.len(), 2);
    drop(view);

    let log = tenant.backend_log.lock();
    assert_eq!(log.executes.len(), 2);
    // The readback unit ends its batch with a FLUSH; the server consumed
    // its rows instead of forwarding them.
    assert_eq!(log.executes[0].sql, vec!["SET-GLOBAL-SQL".to_string()]);
    assert_eq!(log.executes[0].fence, BatchFence::Flush);
    assert!(!log.executes[0].forwarded);
    // The trailing plain unit closes the group with a SYNC.
    assert_eq!(log.executes[1].fence, BatchFence::Sync);
    assert!(log.executes[1].forwarded);
    // The group ended on a SYNC, so no dangling pipeline to close.
    assert_eq!(log.syncs, 0);
    drop(log);

    handle.abort();
}

#[tokio::test]
async fn test_script_failure_aborts_and_poisons_the_pipeline() {
    let mut script = BackendScript::default();
    script.rows_by_sql.insert(
        "SET-GLOBAL-SQL".to_string(),
        vec![Bytes::from_static(b"\x01{\"name\":\"g\",\"value\":1}")],
    );
    script.fail_on_sql.insert(
        "BROKEN-SQL".to_string(),
        crate::errors::BackendErrorFields::new("42601", "syntax error at or near \"nope\""),
    );
    let tenant = Arc::new(MockTenant::new().with_backend_script(script));

    let set_unit = QueryUnit {
        sql: vec!["SET-GLOBAL-SQL".to_string()],
        status: "SET GLOBAL".to_string(),
        needs_readback: true,
        cacheable: true,
        in_type_id: Uuid::from_u128(0x11),
        out_type_id: Uuid::from_u128(0x33),
        ..Default::default()
    };
    let broken_unit = QueryUnit {
        sql: vec!["BROKEN-SQL".to_string()],
        status: "SELECT".to_string(),
        cacheable: true,
        in_type_id: Uuid::from_u128(0x11),
        out_type_id: Uuid::from_u128(0x22),
        ..Default::default()
    };
    tenant.compiler.program(
        "set global g := 1; select nope",
        CompiledQuery::new(QueryUnitGroup {
            units: vec![set_unit, broken_unit],
            cardinality: Cardinality::Many,
        }),
    );

    let (mut client, handle, _) = start_connection(tenant.clone()).await;

    client
        .send_execute(
            "set global g := 1; select nope",
            capability::ALL,
            Uuid::from_u128(0x11),
            Uuid::from_u128(0x22),
        )
        .await;

    let (_, code, _) = decode_error(client.recv_until(MSG_ERROR_RESPONSE).await);
    assert_eq!(code, ErrorKind::Query.code());

    let view = tenant.view_state.lock();
    assert_eq!(view.aborted_txs, 1);
    drop(view);

    let log = tenant.backend_log.lock();
    // The implicit transaction was poisoned and the dangling FLUSH closed.
    assert_eq!(log.forced_errors, 1);
    assert_eq!(log.syncs, 1);
    drop(log);

    client.send_sync().await;
    let mut ready = client.recv_until(MSG_READY_FOR_COMMAND).await;
    ready.get_u16().unwrap();
    assert_eq!(ready.get_u8().unwrap(), TX_STATUS_IDLE);

    handle.abort();
}

// ---------------------------------------------------------------------------
// Dump / Restore
// ---------------------------------------------------------------------------

fn dump_descriptor(block_id: Uuid) -> DumpDescriptor {
    DumpDescriptor {
        schema_ddl: "CREATE TYPE T { CREATE PROPERTY n -> int64; };".to_string(),
        dynamic_ddl: vec![],
        types: vec![DumpTypeInfo {
            type_name: "default::T".to_string(),
            type_desc: "typedesc".to_string(),
            type_id: Uuid::from_u128(0x77),
        }],
        blocks: vec![DumpBlockDesc {
            schema_object_id: block_id,
            type_desc: Bytes::from_static(b"blockdesc"),
            schema_deps: vec![],
        }],
    }
}

#[tokio::test]
async fn test_dump_streams_header_blocks_and_complete() {
    let block_id = Uuid::from_u128(0xB10C);
    let mut script = BackendScript::default();
    script.dump_chunks = vec![(0, 0, Bytes::from_static(b"rowdata"))];
    script.user_schema_json = Bytes::from_static(b"{\"user\":1}");
    script.global_schema_json = Bytes::from_static(b"{\"global\":1}");
    script.db_config_json = Bytes::from_static(b"{}");

    let tenant = Arc::new(MockTenant::new().with_backend_script(script));
    *tenant.compiler.dump_descriptor.lock() = Some(dump_descriptor(block_id));

    let (mut client, handle, _) = start_connection(tenant.clone()).await;

    client
        .send(|w| {
            w.begin(MSG_DUMP);
            w.put_u16(0);
            w.end_message();
        })
        .await;

    let mut header = client.recv().await;
    assert_eq!(header.mtype(), MSG_DUMP_HEADER);
    let headers = header.get_headers().unwrap();
    assert_eq!(headers.len(), 4);
    assert_eq!(header.get_u16().unwrap(), 1); // proto major
    assert_eq!(header.get_u16().unwrap(), 0); // proto minor
    let ddl = header.get_len_bytes().unwrap();
    assert!(ddl.starts_with(b"CREATE TYPE T"));
    let ntypes = header.get_i32().unwrap();
    assert_eq!(ntypes, 1);
    header.get_utf8().unwrap();
    header.get_utf8().unwrap();
    header.get_uuid().unwrap();
    let nblocks = header.get_i32().unwrap();
    assert_eq!(nblocks, 1);

    let mut block = client.recv().await;
    assert_eq!(block.mtype(), MSG_DUMP_BLOCK);
    let block_headers = block.get_headers().unwrap();
    assert_eq!(block_headers.len(), 4);
    assert_eq!(&block_headers[1].1[..], block_id.as_bytes());
    assert_eq!(&block_headers[3].1[..], b"rowdata");

    let mut complete = client.recv().await;
    assert_eq!(complete.mtype(), MSG_COMMAND_COMPLETE);
    complete.get_u16().unwrap();
    complete.get_i64().unwrap();
    assert_eq!(&complete.get_len_bytes().unwrap()[..], b"DUMP");
    // Nil state id, empty state.
    assert_eq!(complete.get_uuid().unwrap(), Uuid::nil());
    assert_eq!(complete.get_len_bytes().unwrap().len(), 0);

    let log = tenant.backend_log.lock();
    assert!(log.sql.iter().any(|s| s.contains("SERIALIZABLE READ ONLY DEFERRABLE")));
    assert!(log.sql.iter().any(|s| s == "ROLLBACK"));
    assert!(log.released >= 1);
    drop(log);

    handle.abort();
}

#[tokio::test]
async fn test_dump_refused_inside_transaction() {
    let tenant = Arc::new(MockTenant::new());
    tenant.view_state.lock().in_tx = true;
    let (mut client, handle, _) = start_connection(tenant).await;

    client
        .send(|w| {
            w.begin(MSG_DUMP);
            w.put_u16(0);
            w.end_message();
        })
        .await;

    let (_, code, _) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::Protocol.code());

    handle.abort();
}

fn restore_units() -> Vec<QueryUnit> {
    vec![QueryUnit {
        sql: vec!["CREATE TABLE t ()".to_string()],
        status: "CREATE TYPE".to_string(),
        ddl_stmt_id: Some("restore-ddl-1".to_string()),
        ..Default::default()
    }]
}

fn tx_unit(source_status: &str, sql: &str, commit: bool) -> CompiledQuery {
    let unit = QueryUnit {
        sql: vec![sql.to_string()],
        status: source_status.to_string(),
        tx_id: if commit { None } else { Some(7) },
        tx_commit: commit,
        cacheable: true,
        ..Default::default()
    };
    CompiledQuery::new(QueryUnitGroup {
        units: vec![unit],
        cardinality: Cardinality::NoResult,
    })
}

#[tokio::test]
async fn test_restore_replays_schema_and_mends_blocks() {
    let block_id = Uuid::from_u128(0xB10C);
    let schema_type = Uuid::from_u128(0x7E57);

    let tenant = Arc::new(MockTenant::new());
    tenant
        .view_state
        .lock()
        .backend_type_ids
        .insert(schema_type, 4242);
    tenant.compiler.program(
        "start transaction isolation serializable",
        tx_unit(
            "START TRANSACTION",
            "START TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            false,
        ),
    );
    tenant.compiler.program("commit", tx_unit("COMMIT", "commit", true));

    let mut blocks = HashMap::new();
    blocks.insert(
        block_id,
        RestoreBlockDesc {
            schema_object_id: block_id,
            sql_copy_stmt: "COPY t FROM STDIN".to_string(),
            data_mending_desc: Some(DataMendingDesc {
                schema_type_id: Some(schema_type),
                needs_mending: true,
                children: vec![],
            }),
        },
    );
    *tenant.compiler.restore_descriptor.lock() = Some(RestoreDescriptor {
        units: restore_units(),
        blocks,
        tables_to_disable_triggers: vec!["t".to_string()],
    });

    let (mut client, handle, _) = start_connection(tenant.clone()).await;

    // Restore request: no headers, one-job hint, then the dump header.
    client
        .send(|w| {
            w.begin(MSG_RESTORE);
            w.put_u16(0);
            w.put_i16(1);
            w.put_u16(0); // dump file headers
            w.put_u16(1); // dump proto
            w.put_u16(0);
            w.put_len_bytes(b"CREATE TYPE T;");
            w.put_i32(0); // types
            w.put_i32(1); // blocks
            w.put_uuid(block_id);
            w.put_len_bytes(b"blockdesc");
            w.put_u16(0); // deps
            w.end_message();
        })
        .await;

    let mut ready = client.recv().await;
    assert_eq!(ready.mtype(), MSG_RESTORE_READY);
    assert_eq!(ready.get_u16().unwrap(), 0);
    assert_eq!(ready.get_i16().unwrap(), 1);

    // One data block, then the terminator.
    client
        .send(|w| {
            w.begin(MSG_RESTORE_BLOCK);
            w.put_u16(4);
            w.put_u16(DUMP_HEADER_BLOCK_TYPE);
            w.put_len_bytes(b"D");
            w.put_u16(DUMP_HEADER_BLOCK_ID);
            w.put_len_bytes(block_id.as_bytes());
            w.put_u16(DUMP_HEADER_BLOCK_NUM);
            w.put_len_bytes(b"0");
            w.put_u16(DUMP_HEADER_BLOCK_DATA);
            w.put_len_bytes(b"blockbytes");
            w.end_message();
        })
        .await;
    client
        .send(|w| {
            w.begin(MSG_RESTORE_EOF);
            w.end_message();
        })
        .await;

    let mut complete = client.recv_until(MSG_COMMAND_COMPLETE).await;
    complete.get_u16().unwrap();
    complete.get_i64().unwrap();
    assert_eq!(&complete.get_len_bytes().unwrap()[..], b"RESTORE");

    let view = tenant.view_state.lock();
    assert!(view.succeeded.iter().any(|s| s == "COMMIT"));
    assert!(view.side_effects.contains(&SideEffect::SchemaChanges));
    drop(view);

    let log = tenant.backend_log.lock();
    assert_eq!(log.restore_calls.len(), 1);
    let (restored_block, data, map) = &log.restore_calls[0];
    assert_eq!(*restored_block, block_id);
    assert_eq!(&data[..], b"blockbytes");
    assert_eq!(map[&schema_type], 4242);
    assert!(log.ddl.contains(&"restore-ddl-1".to_string()));
    assert!(log
        .sql
        .iter()
        .any(|s| s.contains("ALTER TABLE t DISABLE TRIGGER ALL")));
    assert!(log
        .sql
        .iter()
        .any(|s| s.contains("ALTER TABLE t ENABLE TRIGGER ALL")));
    assert!(log.sql.iter().any(|s| s == "commit"));
    drop(log);

    assert_eq!(
        tenant
            .introspections
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    handle.abort();
}

#[tokio::test]
async fn test_restore_rejects_unsupported_dump_version() {
    let tenant = Arc::new(MockTenant::new());
    let (mut client, handle, _) = start_connection(tenant).await;

    client
        .send(|w| {
            w.begin(MSG_RESTORE);
            w.put_u16(0);
            w.put_i16(1);
            w.put_u16(0);
            w.put_u16(0); // dump proto 0.5: too old
            w.put_u16(5);
            w.put_len_bytes(b"");
            w.put_i32(0);
            w.put_i32(0);
            w.end_message();
        })
        .await;

    let (_, code, message) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::Protocol.code());
    assert!(message.contains("dump version"), "{message}");

    handle.abort();
}

#[tokio::test]
async fn test_incomplete_restore_block_is_rejected() {
    let block_id = Uuid::from_u128(0xB10C);
    let tenant = Arc::new(MockTenant::new());
    tenant.compiler.program(
        "start transaction isolation serializable",
        tx_unit(
            "START TRANSACTION",
            "START TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            false,
        ),
    );
    tenant.compiler.program("commit", tx_unit("COMMIT", "commit", true));
    *tenant.compiler.restore_descriptor.lock() = Some(RestoreDescriptor {
        units: vec![],
        blocks: HashMap::new(),
        tables_to_disable_triggers: vec![],
    });

    let (mut client, handle, _) = start_connection(tenant.clone()).await;

    client
        .send(|w| {
            w.begin(MSG_RESTORE);
            w.put_u16(0);
            w.put_i16(1);
            w.put_u16(0);
            w.put_u16(1);
            w.put_u16(0);
            w.put_len_bytes(b"");
            w.put_i32(0);
            w.put_i32(0);
            w.end_message();
        })
        .await;
    client.recv_until(MSG_RESTORE_READY).await;

    // A data block missing BLOCK_DATA.
    client
        .send(|w| {
            w.begin(MSG_RESTORE_BLOCK);
            w.put_u16(2);
            w.put_u16(DUMP_HEADER_BLOCK_TYPE);
            w.put_len_bytes(b"D");
            w.put_u16(DUMP_HEADER_BLOCK_ID);
            w.put_len_bytes(block_id.as_bytes());
            w.end_message();
        })
        .await;

    let (_, code, message) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::Protocol.code());
    assert!(message.contains("incomplete data block"), "{message}");

    // The transaction was rolled back on the backend and the view aborted.
    let log = tenant.backend_log.lock();
    assert!(log.sql.iter().any(|s| s == "ROLLBACK"));
    drop(log);

    handle.abort();
}

#[tokio::test]
async fn test_backend_error_goes_through_schema_aware_interpretation() {
    let mut script = BackendScript::default();
    script.fail_on_sql.insert(
        "INSERT-SQL".to_string(),
        crate::errors::BackendErrorFields::new("23505", "duplicate key value \"t1_idx\""),
    );
    let tenant = Arc::new(MockTenant::new().with_backend_script(script));
    tenant
        .compiler
        .program("insert T", single_unit_query("INSERT", "INSERT-SQL"));

    let (mut client, handle, _) = start_connection(tenant.clone()).await;

    client
        .send_execute(
            "insert T",
            capability::ALL,
            Uuid::from_u128(0x11),
            Uuid::from_u128(0x22),
        )
        .await;

    let (_, code, message) = decode_error(client.recv().await);
    // A constraint violation needs the compiler's schema for its message.
    assert_eq!(code, ErrorKind::Execution.code());
    assert!(message.starts_with("interpreted:"), "{message}");

    assert_eq!(tenant.view_state.lock().errors, 1);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_timeout_closes_the_connection() {
    let tenant = Arc::new(MockTenant::new());
    let (client_side, server_side) = tokio::io::duplex(1 << 16);
    let (read_half, write_half) = tokio::io::split(server_side);
    let config = FrontendConfig {
        idle_session_timeout_secs: Some(5),
        ..Default::default()
    };
    let handle = tokio::spawn(async move {
        let conn = Connection::startup(
            read_half,
            write_half,
            tenant,
            Arc::new(config),
            TransportKind::Stream,
            HashMap::new(),
            None,
        )
        .await?;
        conn.run().await
    });

    let mut client = TestClient {
        stream: client_side,
        inbound: MessageBuffer::new(),
    };
    client
        .send_handshake(1, 0, &[("user", "edgedb"), ("database", "main")])
        .await;
    client.recv_until(MSG_READY_FOR_COMMAND).await;

    // No further requests: the server times the session out.
    let (severity, code, _) = decode_error(client.recv().await);
    assert_eq!(code, ErrorKind::IdleSessionTimeout.code());
    assert_eq!(severity, crate::errors::SEVERITY_FATAL);
    assert!(handle.await.unwrap().is_err());
}

#[tokio::test]
async fn test_terminate_closes_cleanly() {
    let tenant = Arc::new(MockTenant::new());
    let (mut client, handle, _) = start_connection(tenant).await;
    client
        .send(|w| {
            w.begin(MSG_TERMINATE);
            w.end_message();
        })
        .await;
    assert!(handle.await.unwrap().is_ok());
}
