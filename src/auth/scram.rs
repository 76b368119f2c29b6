//! Server side of SCRAM-SHA-256 (RFC 5802/7677).
//!
//! Credentials are stored as a verifier (salt, iteration count, stored key,
//! server key); the cleartext password never reaches this module at
//! authentication time.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::errors::Error;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_ITERATIONS: u32 = 4096;
const SERVER_NONCE_RAW_LEN: usize = 18;

/// Stored SCRAM credentials for one role.
#[derive(Debug, Clone)]
pub struct ScramVerifier {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub stored_key: [u8; 32],
    pub server_key: [u8; 32],
}

impl ScramVerifier {
    /// Derive a verifier from a cleartext password. Used at role-creation
    /// time and by tests.
    pub fn from_password(password: &str, salt: &[u8], iterations: u32) -> Result<Self, Error> {
        let normalized = stringprep::saslprep(password)
            .map_err(|_| Error::authentication("password failed saslprep normalization"))?;
        let salted = hi(normalized.as_bytes(), salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let server_key = hmac(&salted, b"Server Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        Ok(ScramVerifier {
            iterations,
            salt: salt.to_vec(),
            stored_key,
            server_key,
        })
    }

    /// Parse the catalog text form:
    /// `SCRAM-SHA-256$<iterations>:<b64 salt>$<b64 stored>:<b64 server>`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let bad = || Error::authentication("malformed SCRAM verifier");
        let rest = text.strip_prefix("SCRAM-SHA-256$").ok_or_else(bad)?;
        let (params, keys) = rest.split_once('$').ok_or_else(bad)?;
        let (iterations, salt) = params.split_once(':').ok_or_else(bad)?;
        let (stored, server) = keys.split_once(':').ok_or_else(bad)?;
        let iterations: u32 = iterations.parse().map_err(|_| bad())?;
        let salt = B64.decode(salt).map_err(|_| bad())?;
        let stored_key: [u8; 32] = B64
            .decode(stored)
            .map_err(|_| bad())?
            .try_into()
            .map_err(|_| bad())?;
        let server_key: [u8; 32] = B64
            .decode(server)
            .map_err(|_| bad())?
            .try_into()
            .map_err(|_| bad())?;
        Ok(ScramVerifier {
            iterations,
            salt,
            stored_key,
            server_key,
        })
    }
}

/// One in-flight SCRAM exchange.
#[derive(Debug)]
pub struct ScramExchange {
    verifier: ScramVerifier,
    client_first_bare: String,
    server_first: String,
    full_nonce: String,
}

impl ScramExchange {
    /// Consume the client-first message and produce the server-first
    /// challenge.
    pub fn begin(verifier: ScramVerifier, client_first: &[u8]) -> Result<(Self, String), Error> {
        let client_first = std::str::from_utf8(client_first)
            .map_err(|_| Error::binary_protocol("SCRAM client-first is not UTF-8"))?;

        // gs2 header: we never advertise channel binding.
        let bare = client_first
            .strip_prefix("n,,")
            .or_else(|| client_first.strip_prefix("y,,"))
            .ok_or_else(|| {
                if client_first.starts_with("p=") {
                    Error::authentication("channel binding is not supported")
                } else {
                    Error::authentication("malformed SCRAM client-first message")
                }
            })?;

        let client_nonce = attribute(bare, 'r')
            .ok_or_else(|| Error::authentication("SCRAM client-first lacks a nonce"))?;

        let server_part: [u8; SERVER_NONCE_RAW_LEN] = rand::random();
        let full_nonce = format!("{client_nonce}{}", B64.encode(server_part));
        let server_first = format!(
            "r={full_nonce},s={},i={}",
            B64.encode(&verifier.salt),
            verifier.iterations
        );

        Ok((
            ScramExchange {
                verifier,
                client_first_bare: bare.to_string(),
                server_first: server_first.clone(),
                full_nonce,
            },
            server_first,
        ))
    }

    /// Verify the client proof; on success returns the server-final
    /// message carrying the server signature.
    pub fn verify_final(self, client_final: &[u8]) -> Result<String, Error> {
        let client_final = std::str::from_utf8(client_final)
            .map_err(|_| Error::binary_protocol("SCRAM client-final is not UTF-8"))?;

        let nonce = attribute(client_final, 'r')
            .ok_or_else(|| Error::authentication("SCRAM client-final lacks a nonce"))?;
        if nonce != self.full_nonce {
            return Err(Error::authentication("SCRAM nonce mismatch"));
        }

        let proof_b64 = attribute(client_final, 'p')
            .ok_or_else(|| Error::authentication("SCRAM client-final lacks a proof"))?;
        let proof: [u8; 32] = B64
            .decode(proof_b64)
            .map_err(|_| Error::authentication("malformed SCRAM proof"))?
            .try_into()
            .map_err(|_| Error::authentication("malformed SCRAM proof"))?;

        let without_proof = client_final
            .rsplit_once(",p=")
            .map(|(head, _)| head)
            .unwrap_or(client_final);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, without_proof
        );

        let client_signature = hmac(&self.verifier.stored_key, auth_message.as_bytes());
        let mut client_key = [0u8; 32];
        for (i, b) in client_key.iter_mut().enumerate() {
            *b = proof[i] ^ client_signature[i];
        }
        let derived_stored: [u8; 32] = Sha256::digest(client_key).into();
        if derived_stored != self.verifier.stored_key {
            return Err(Error::authentication("authentication failed"));
        }

        let server_signature = hmac(&self.verifier.server_key, auth_message.as_bytes());
        Ok(format!("v={}", B64.encode(server_signature)))
    }
}

fn attribute<'a>(message: &'a str, key: char) -> Option<&'a str> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        if chars.next() == Some(key) && chars.next() == Some('=') {
            Some(&part[2..])
        } else {
            None
        }
    })
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// The Hi() function of RFC 5802: PBKDF2 with HMAC-SHA-256.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &block);
    let mut result = u;
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, x) in result.iter_mut().zip(u.iter()) {
            *r ^= x;
        }
    }
    result
}
