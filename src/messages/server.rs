//! Constructors for server -> client frames.
//!
//! Each helper appends one complete message to a [`MessageWriter`]; the
//! caller decides when the buffer is flushed to the socket.

use uuid::Uuid;

use crate::compiler::{DumpBlockDesc, DumpTypeInfo};
use crate::errors::Error;
use crate::messages::codec::{MessageWriter, ProtocolVersion};
use crate::messages::constants::*;

/// `v` NegotiateProtocolVersion: the version the server is willing to
/// speak, plus an (empty) extension list.
pub fn negotiate_protocol_version(w: &mut MessageWriter, target: ProtocolVersion) {
    w.begin(MSG_NEGOTIATE_PROTOCOL);
    w.put_u16(target.major);
    w.put_u16(target.minor);
    w.put_u16(0);
    w.end_message();
}

/// `R` with status SASL: method names in server preference order.
pub fn auth_sasl_methods(w: &mut MessageWriter, methods: &[&str]) {
    w.begin(MSG_AUTHENTICATION);
    w.put_i32(AUTH_SASL as i32);
    w.put_i32(methods.len() as i32);
    for method in methods {
        w.put_utf8(method);
    }
    w.end_message();
}

/// `R` with status SASLContinue carrying an opaque server challenge.
pub fn auth_sasl_continue(w: &mut MessageWriter, challenge: &[u8]) {
    w.begin(MSG_AUTHENTICATION);
    w.put_i32(AUTH_SASL_CONTINUE as i32);
    w.put_len_bytes(challenge);
    w.end_message();
}

/// `R` with status SASLFinal carrying the server signature.
pub fn auth_sasl_final(w: &mut MessageWriter, data: &[u8]) {
    w.begin(MSG_AUTHENTICATION);
    w.put_i32(AUTH_SASL_FINAL as i32);
    w.put_len_bytes(data);
    w.end_message();
}

/// `R` with status OK.
pub fn auth_ok(w: &mut MessageWriter) {
    w.begin(MSG_AUTHENTICATION);
    w.put_i32(AUTH_OK as i32);
    w.end_message();
}

/// `K` ServerKeyData. The 32 bytes are reserved for a server-chosen
/// session id; clients must not interpret them.
pub fn server_key_data(w: &mut MessageWriter) {
    w.begin(MSG_SERVER_KEY_DATA);
    w.put_raw(&[0u8; 32]);
    w.end_message();
}

/// `s` StateDataDescription: the type id and descriptor of the session
/// state the server currently accepts.
pub fn state_description(w: &mut MessageWriter, type_id: Uuid, type_desc: &[u8]) {
    w.begin(MSG_STATE_DESCRIPTION);
    w.put_uuid(type_id);
    w.put_len_bytes(type_desc);
    w.end_message();
}

/// `S` ParameterStatus.
pub fn server_status(w: &mut MessageWriter, name: &str, value: &[u8]) {
    w.begin(MSG_SERVER_STATUS);
    w.put_utf8(name);
    w.put_len_bytes(value);
    w.end_message();
}

/// `Z` ReadyForCommand with the view-derived transaction status byte.
pub fn ready_for_command(w: &mut MessageWriter, tx_status: u8) {
    w.begin(MSG_READY_FOR_COMMAND);
    w.put_u16(0);
    w.put_u8(tx_status);
    w.end_message();
}

/// `T` CommandDataDescription.
pub fn command_data_description(
    w: &mut MessageWriter,
    capabilities: u64,
    cardinality: u8,
    in_type_id: Uuid,
    in_type_desc: &[u8],
    out_type_id: Uuid,
    out_type_desc: &[u8],
) {
    w.begin(MSG_COMMAND_DATA_DESCRIPTION);
    w.put_u16(0);
    w.put_i64(capabilities as i64);
    w.put_u8(cardinality);
    w.put_uuid(in_type_id);
    w.put_len_bytes(in_type_desc);
    w.put_uuid(out_type_id);
    w.put_len_bytes(out_type_desc);
    w.end_message();
}

/// `C` CommandComplete.
pub fn command_complete(
    w: &mut MessageWriter,
    capabilities: u64,
    status: &str,
    state_type_id: Uuid,
    state_data: &[u8],
) {
    w.begin(MSG_COMMAND_COMPLETE);
    w.put_u16(0);
    w.put_i64(capabilities as i64);
    w.put_len_bytes(status.as_bytes());
    w.put_uuid(state_type_id);
    w.put_len_bytes(state_data);
    w.end_message();
}

/// `D` Data carrying a single element.
pub fn data_row(w: &mut MessageWriter, element: &[u8]) {
    w.begin(MSG_DATA);
    w.put_u16(1);
    w.put_len_bytes(element);
    w.end_message();
}

/// `D` Data carrying raw pre-encoded elements.
pub fn data_raw(w: &mut MessageWriter, num_elements: u16, payload: &[u8]) {
    w.begin(MSG_DATA);
    w.put_u16(num_elements);
    w.put_raw(payload);
    w.end_message();
}

/// `E` ErrorResponse.
pub fn error_response(w: &mut MessageWriter, err: &Error) {
    w.begin(MSG_ERROR_RESPONSE);
    w.put_u8(err.severity());
    w.put_i32(err.code() as i32);
    w.put_utf8(&err.message);
    let fields = err.wire_fields();
    w.put_u16(fields.len() as u16);
    for (key, value) in &fields {
        w.put_u16(*key);
        w.put_utf8(value);
    }
    w.end_message();
}

/// `L` LogMessage.
pub fn log_message(w: &mut MessageWriter, severity: u8, code: u32, text: &str) {
    w.begin(MSG_LOG);
    w.put_u8(severity);
    w.put_i32(code as i32);
    w.put_utf8(text);
    w.put_u16(0);
    w.end_message();
}

/// `@` DumpHeader.
///
/// The `SERVER_CATALOG_VERSION` header value is written as `i32 8` followed
/// by the i64 itself, which is coherent with the generic header shape but
/// fixed-size; restore relies on this exact layout.
#[allow(clippy::too_many_arguments)]
pub fn dump_header(
    w: &mut MessageWriter,
    server_version: &str,
    catalog_version: i64,
    server_time_unix: i64,
    proto: ProtocolVersion,
    schema_ddl: &[u8],
    types: &[DumpTypeInfo],
    blocks: &[DumpBlockDesc],
) {
    w.begin(MSG_DUMP_HEADER);
    w.put_u16(4);
    w.put_u16(DUMP_HEADER_BLOCK_TYPE);
    w.put_len_bytes(DUMP_BLOCK_TYPE_INFO);
    w.put_u16(DUMP_HEADER_SERVER_VER);
    w.put_len_bytes(server_version.as_bytes());
    w.put_u16(DUMP_HEADER_SERVER_CATALOG_VERSION);
    w.put_i32(8);
    w.put_i64(catalog_version);
    w.put_u16(DUMP_HEADER_SERVER_TIME);
    w.put_len_bytes(server_time_unix.to_string().as_bytes());

    w.put_u16(proto.major);
    w.put_u16(proto.minor);
    w.put_len_bytes(schema_ddl);

    w.put_i32(types.len() as i32);
    for ty in types {
        w.put_utf8(&ty.type_name);
        w.put_utf8(&ty.type_desc);
        w.put_uuid(ty.type_id);
    }

    w.put_i32(blocks.len() as i32);
    for block in blocks {
        w.put_uuid(block.schema_object_id);
        w.put_len_bytes(&block.type_desc);
        w.put_u16(block.schema_deps.len() as u16);
        for dep in &block.schema_deps {
            w.put_uuid(*dep);
        }
    }
    w.end_message();
}

/// `=` DumpBlock.
pub fn dump_block(w: &mut MessageWriter, block_id: Uuid, block_num: u64, data: &[u8]) {
    w.begin(MSG_DUMP_BLOCK);
    w.put_u16(4);
    w.put_u16(DUMP_HEADER_BLOCK_TYPE);
    w.put_len_bytes(DUMP_BLOCK_TYPE_DATA);
    w.put_u16(DUMP_HEADER_BLOCK_ID);
    w.put_len_bytes(block_id.as_bytes());
    w.put_u16(DUMP_HEADER_BLOCK_NUM);
    w.put_len_bytes(block_num.to_string().as_bytes());
    w.put_u16(DUMP_HEADER_BLOCK_DATA);
    w.put_len_bytes(data);
    w.end_message();
}

/// `+` RestoreReady.
pub fn restore_ready(w: &mut MessageWriter, jobs: i16) {
    w.begin(MSG_RESTORE_READY);
    w.put_u16(0);
    w.put_i16(jobs);
    w.end_message();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, FIELD_HINT};
    use crate::messages::codec::MessageBuffer;

    fn decode_one(w: &mut MessageWriter) -> crate::messages::codec::Incoming {
        let mut mbuf = MessageBuffer::new();
        mbuf.feed(&w.take());
        mbuf.take_message().unwrap().unwrap()
    }

    #[test]
    fn test_ready_for_command_layout() {
        let mut w = MessageWriter::new();
        ready_for_command(&mut w, TX_STATUS_IDLE);
        let mut msg = decode_one(&mut w);
        assert_eq!(msg.mtype(), MSG_READY_FOR_COMMAND);
        assert_eq!(msg.get_u16().unwrap(), 0);
        assert_eq!(msg.get_u8().unwrap(), b'I');
        msg.finish().unwrap();
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let err = Error::new(ErrorKind::DisabledCapability, "ddl is disabled")
            .with_hint("enable the ddl capability");
        let mut w = MessageWriter::new();
        error_response(&mut w, &err);
        let mut msg = decode_one(&mut w);
        assert_eq!(msg.mtype(), MSG_ERROR_RESPONSE);
        assert_eq!(msg.get_u8().unwrap(), err.severity());
        assert_eq!(msg.get_i32().unwrap() as u32, err.code());
        assert_eq!(msg.get_utf8().unwrap(), "ddl is disabled");
        let nfields = msg.get_u16().unwrap();
        assert_eq!(nfields, 1);
        assert_eq!(msg.get_u16().unwrap(), FIELD_HINT);
        assert_eq!(msg.get_utf8().unwrap(), "enable the ddl capability");
        msg.finish().unwrap();
    }

    #[test]
    fn test_dump_block_carries_four_headers() {
        let id = Uuid::from_u128(7);
        let mut w = MessageWriter::new();
        dump_block(&mut w, id, 3, b"rows");
        let mut msg = decode_one(&mut w);
        assert_eq!(msg.mtype(), MSG_DUMP_BLOCK);
        let headers = msg.get_headers().unwrap();
        assert_eq!(headers.len(), 4);
        assert_eq!(headers[0].0, DUMP_HEADER_BLOCK_TYPE);
        assert_eq!(&headers[1].1[..], id.as_bytes());
        assert_eq!(&headers[2].1[..], b"3");
        assert_eq!(&headers[3].1[..], b"rows");
        msg.finish().unwrap();
    }

    #[test]
    fn test_catalog_version_header_is_fixed_size() {
        let mut w = MessageWriter::new();
        dump_header(
            &mut w,
            "6.1+c0ffee",
            42,
            1_700_000_000,
            ProtocolVersion::new(1, 0),
            b"CREATE TYPE X;",
            &[],
            &[],
        );
        let mut msg = decode_one(&mut w);
        let headers = msg.get_headers().unwrap();
        assert_eq!(headers.len(), 4);
        let catalog = headers
            .iter()
            .find(|(k, _)| *k == DUMP_HEADER_SERVER_CATALOG_VERSION)
            .unwrap();
        assert_eq!(catalog.1.len(), 8);
        assert_eq!(i64::from_be_bytes(catalog.1[..].try_into().unwrap()), 42);
    }

    #[test]
    fn test_server_key_data_reserved_bytes() {
        let mut w = MessageWriter::new();
        server_key_data(&mut w);
        let mut msg = decode_one(&mut w);
        assert_eq!(msg.remaining(), 32);
        assert!(msg.get_rest().iter().all(|b| *b == 0));
    }
}
