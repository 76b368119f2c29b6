//! Engine configuration.
//!
//! The embedding server hands every connection a shared [`FrontendConfig`].
//! Values come from the server's TOML config file; everything has a
//! workable default.

use std::path::Path;

use serde::Deserialize;

use crate::errors::Error;

fn default_write_high_water() -> usize {
    8192
}

fn default_dump_queue_depth() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendConfig {
    /// Flush the outbound buffer once it grows past this many bytes.
    #[serde(default = "default_write_high_water")]
    pub write_high_water: usize,

    /// Bounded queue depth between the dump producer and the socket
    /// consumer.
    #[serde(default = "default_dump_queue_depth")]
    pub dump_queue_depth: usize,

    /// Close connections idle for this many seconds. `None` disables the
    /// timeout.
    #[serde(default)]
    pub idle_session_timeout_secs: Option<u64>,

    /// Dev mode announces the backend address in a `pgaddr` status.
    #[serde(default)]
    pub dev_mode: bool,

    /// PEM file with the JWT verification key(s).
    #[serde(default)]
    pub jwt_key_file: Option<String>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        FrontendConfig {
            write_high_water: default_write_high_water(),
            dump_queue_depth: default_dump_queue_depth(),
            idle_session_timeout_secs: None,
            dev_mode: false,
            jwt_key_file: None,
        }
    }
}

impl FrontendConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::internal(format!("bad frontend config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::internal(format!("cannot read frontend config: {e}")))?;
        Self::from_toml_str(&text)
    }
}
