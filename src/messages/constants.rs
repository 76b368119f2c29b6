//! Protocol constants: message type bytes, auth codes, header keys.

/// Client -> server message types.
pub const MSG_CLIENT_HANDSHAKE: u8 = b'V';
pub const MSG_AUTH_SASL_INITIAL: u8 = b'p';
pub const MSG_AUTH_SASL_RESPONSE: u8 = b'r';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_EXECUTE: u8 = b'O';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_FLUSH: u8 = b'H';
pub const MSG_TERMINATE: u8 = b'X';
pub const MSG_DUMP: u8 = b'>';
pub const MSG_RESTORE: u8 = b'<';
pub const MSG_RESTORE_BLOCK: u8 = b'=';
pub const MSG_RESTORE_EOF: u8 = b'.';

/// Legacy message types from protocol generations this server no longer
/// speaks. Recognized only to be rejected with a useful error.
pub const MSG_LEGACY_DESCRIBE: u8 = b'D';
pub const MSG_LEGACY_EXECUTE: u8 = b'E';
pub const MSG_LEGACY_EXECUTE_SCRIPT: u8 = b'Q';

/// Server -> client message types.
pub const MSG_NEGOTIATE_PROTOCOL: u8 = b'v';
pub const MSG_AUTHENTICATION: u8 = b'R';
pub const MSG_SERVER_KEY_DATA: u8 = b'K';
pub const MSG_STATE_DESCRIPTION: u8 = b's';
pub const MSG_SERVER_STATUS: u8 = b'S';
pub const MSG_COMMAND_DATA_DESCRIPTION: u8 = b'T';
pub const MSG_DATA: u8 = b'D';
pub const MSG_COMMAND_COMPLETE: u8 = b'C';
pub const MSG_READY_FOR_COMMAND: u8 = b'Z';
pub const MSG_ERROR_RESPONSE: u8 = b'E';
pub const MSG_LOG: u8 = b'L';
pub const MSG_DUMP_HEADER: u8 = b'@';
pub const MSG_DUMP_BLOCK: u8 = b'=';
pub const MSG_RESTORE_READY: u8 = b'+';

/// Authentication status codes in the `R` frame.
pub const AUTH_OK: u32 = 0;
pub const AUTH_SASL: u32 = 10;
pub const AUTH_SASL_CONTINUE: u32 = 11;
pub const AUTH_SASL_FINAL: u32 = 12;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Transaction status bytes in the `Z` frame.
pub const TX_STATUS_IDLE: u8 = b'I';
pub const TX_STATUS_IN_TX: u8 = b'T';
pub const TX_STATUS_IN_FAILED_TX: u8 = b'E';

/// Output format bytes in `ParseExecuteRequest`.
pub const FORMAT_BINARY: u8 = b'b';
pub const FORMAT_JSON: u8 = b'j';
pub const FORMAT_JSON_ELEMENTS: u8 = b'J';
pub const FORMAT_NONE: u8 = b'n';

/// Cardinality bytes.
pub const CARDINALITY_NO_RESULT: u8 = b'n';
pub const CARDINALITY_AT_MOST_ONE: u8 = b'o';
pub const CARDINALITY_MANY: u8 = b'm';

/// Generic request header keys.
pub const HEADER_CAPABILITIES: u16 = 0xFF04;
pub const HEADER_DUMP_SECRETS: u16 = 0xFF10;

/// Dump-file header keys. These appear both in the `@` DumpHeader frame and
/// in each `=` block frame.
pub const DUMP_HEADER_BLOCK_TYPE: u16 = 101;
pub const DUMP_HEADER_SERVER_TIME: u16 = 102;
pub const DUMP_HEADER_SERVER_VER: u16 = 103;
pub const DUMP_HEADER_SERVER_CATALOG_VERSION: u16 = 104;
pub const DUMP_HEADER_BLOCK_ID: u16 = 110;
pub const DUMP_HEADER_BLOCK_NUM: u16 = 111;
pub const DUMP_HEADER_BLOCK_DATA: u16 = 112;

pub const DUMP_BLOCK_TYPE_INFO: &[u8] = b"I";
pub const DUMP_BLOCK_TYPE_DATA: &[u8] = b"D";

/// Compilation flag bits in `ParseExecuteRequest`.
pub const COMPILATION_INJECT_OUTPUT_TYPE_IDS: u64 = 1 << 0;
pub const COMPILATION_INJECT_OUTPUT_TYPE_NAMES: u64 = 1 << 1;
pub const COMPILATION_INJECT_OUTPUT_OBJECT_IDS: u64 = 1 << 2;

/// Log severity bytes for the `L` frame.
pub const LOG_SEVERITY_DEBUG: u8 = 20;
pub const LOG_SEVERITY_INFO: u8 = 40;
pub const LOG_SEVERITY_NOTICE: u8 = 60;
pub const LOG_SEVERITY_WARNING: u8 = 80;
