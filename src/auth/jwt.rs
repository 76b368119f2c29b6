//! JWT bearer validation with scoped claims.
//!
//! Tokens arrive either in the transport's authorization header or in the
//! `secret_key` connection parameter, wrapped in a versioned prefix. The
//! signature is checked against the tenant's key ring (RS256 or ES256);
//! claims then gate which roles, instances and databases the holder may
//! reach.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use jwt::{AlgorithmType, Header, PKeyWithDigest, Token, VerifyWithKey};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use serde_json::Value;

use crate::errors::Error;

/// Token prefixes ending in `1_` carry version-1 claims.
const PREFIXES_V1: [&str; 2] = ["nbwt1_", "edbt1_"];
const PREFIXES_LEGACY: [&str; 2] = ["nbwt_", "edbt_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVersion {
    V1,
    Legacy,
}

/// Public keys accepted for token signatures.
#[derive(Default)]
pub struct JwtKeyRing {
    keys: Vec<PKeyWithDigest<Public>>,
}

impl JwtKeyRing {
    pub fn new() -> Self {
        JwtKeyRing { keys: Vec::new() }
    }

    pub fn load_pem(&mut self, pem: &[u8]) -> Result<(), Error> {
        let key = PKey::public_key_from_pem(pem)
            .map_err(|e| Error::internal(format!("cannot load JWT public key: {e}")))?;
        self.keys.push(PKeyWithDigest {
            digest: MessageDigest::sha256(),
            key,
        });
        Ok(())
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        let mut ring = JwtKeyRing::new();
        ring.load_pem(pem)?;
        Ok(ring)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Pull the raw token out of the transport auth data or the `secret_key`
/// connection parameter.
pub fn extract_token<'a>(
    auth_data: Option<&'a str>,
    secret_key_param: Option<&'a str>,
) -> Result<&'a str, Error> {
    if let Some(data) = auth_data {
        if let Some(token) = data.strip_prefix("Bearer ").or_else(|| data.strip_prefix("bearer ")) {
            return Ok(token.trim());
        }
        return Err(Error::authentication("unrecognized authentication scheme"));
    }
    secret_key_param
        .ok_or_else(|| Error::authentication("client did not provide an authorization token"))
}

/// Strip the versioned prefix, rejecting unknown wrappers.
pub fn strip_token_prefix(token: &str) -> Result<(&str, TokenVersion), Error> {
    for prefix in PREFIXES_V1 {
        if let Some(rest) = token.strip_prefix(prefix) {
            return Ok((rest, TokenVersion::V1));
        }
    }
    for prefix in PREFIXES_LEGACY {
        if let Some(rest) = token.strip_prefix(prefix) {
            return Ok((rest, TokenVersion::Legacy));
        }
    }
    Err(Error::authentication("malformed authorization token"))
}

/// Verify the signature and time claims; return the raw claims object.
pub fn validate_token(ring: &JwtKeyRing, token: &str) -> Result<Value, Error> {
    let unverified: Token<Header, Value, _> = Token::parse_unverified(token).map_err(|e| {
        if matches!(e, jwt::Error::Json(_)) {
            Error::authentication("malformed claims")
        } else {
            Error::authentication("malformed JWT")
        }
    })?;

    let alg = unverified.header().algorithm;
    if !matches!(alg, AlgorithmType::Rs256 | AlgorithmType::Es256) {
        return Err(Error::authentication(format!(
            "unsupported JWT signing algorithm: {alg:?}"
        )));
    }

    for key in &ring.keys {
        let verified: Result<Token<Header, Value, _>, jwt::Error> =
            VerifyWithKey::verify_with_key(token, key);
        match verified {
            Ok(token) => {
                let claims = token.claims().clone();
                validate_time_claims(&claims)?;
                return Ok(claims);
            }
            Err(_) => continue,
        }
    }
    Err(Error::authentication("invalid JWT signature"))
}

fn validate_time_claims(claims: &Value) -> Result<(), Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    if let Some(nbf) = claims.get("nbf").and_then(Value::as_u64) {
        if now < nbf {
            return Err(Error::authentication("token is not yet valid"));
        }
    }
    if let Some(exp) = claims.get("exp").and_then(Value::as_u64) {
        if now > exp {
            return Err(Error::authentication("token has expired"));
        }
    }
    Ok(())
}

/// The three scope sets a token may constrain. `None` means
/// "unconstrained".
#[derive(Debug, Default, Clone)]
pub struct ScopeSets {
    pub roles: Option<HashSet<String>>,
    pub instances: Option<HashSet<String>>,
    pub databases: Option<HashSet<String>>,
}

fn claim_string_set(claims: &Value, claim: &str) -> Result<Option<HashSet<String>>, Error> {
    if claims
        .get(format!("{claim}.all"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Ok(None);
    }
    match claims.get(claim) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut set = HashSet::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => {
                        set.insert(s.to_string());
                    }
                    None => return Err(Error::authentication("malformed claims")),
                }
            }
            Ok(Some(set))
        }
        Some(_) => Err(Error::authentication("malformed claims")),
    }
}

pub fn parse_scopes(claims: &Value, version: TokenVersion) -> Result<ScopeSets, Error> {
    match version {
        TokenVersion::V1 => Ok(ScopeSets {
            roles: claim_string_set(claims, "edb.r")?,
            instances: claim_string_set(claims, "edb.i")?,
            databases: claim_string_set(claims, "edb.d")?,
        }),
        TokenVersion::Legacy => {
            let any_role = claims
                .get("edgedb.server.any_role")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let roles = if any_role {
                None
            } else {
                claim_string_set(claims, "edgedb.server.roles")?
            };
            Ok(ScopeSets {
                roles,
                instances: None,
                databases: None,
            })
        }
    }
}

/// Membership checks, each failure citing the scope that refused.
pub fn check_authz(
    scopes: &ScopeSets,
    instance_name: &str,
    dbname: &str,
    user: &str,
) -> Result<(), Error> {
    if let Some(instances) = &scopes.instances {
        if !instances.contains(instance_name) {
            return Err(Error::authentication(format!(
                "secret key does not authorize access to this instance \"{instance_name}\""
            )));
        }
    }
    if let Some(databases) = &scopes.databases {
        if !databases.contains(dbname) {
            return Err(Error::authentication(format!(
                "secret key does not authorize access to database \"{dbname}\""
            )));
        }
    }
    if let Some(roles) = &scopes.roles {
        if !roles.contains(user) {
            return Err(Error::authentication(format!(
                "secret key does not authorize access in role \"{user}\""
            )));
        }
    }
    Ok(())
}
