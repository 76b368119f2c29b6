//! Client authentication: the SASL wire exchange and the JWT bearer path.

pub mod jwt;
pub mod scram;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::Error;
use crate::messages::codec::{FrameReader, MessageWriter};
use crate::messages::constants::{MSG_AUTH_SASL_INITIAL, MSG_AUTH_SASL_RESPONSE, SCRAM_SHA_256};
use crate::messages::server;
use crate::tenant::Tenant;

use scram::{ScramExchange, ScramVerifier};

/// Drive a full SCRAM-SHA-256 SASL exchange. On success the `R` SASLFinal
/// frame is buffered; the caller appends the authentication-OK sequence.
pub async fn authenticate_sasl<S, W>(
    reader: &mut FrameReader<S>,
    out: &mut MessageWriter,
    stream: &mut W,
    verifier: ScramVerifier,
) -> Result<(), Error>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    server::auth_sasl_methods(out, &[SCRAM_SHA_256]);
    out.flush_to(stream).await?;

    let mut initial = reader.wait_for_message().await?;
    if initial.mtype() != MSG_AUTH_SASL_INITIAL {
        return Err(Error::binary_protocol(format!(
            "expected SASL initial response, got '{}'",
            initial.mtype() as char
        )));
    }
    let mechanism = initial.get_utf8()?;
    let client_first = initial.get_len_bytes()?;
    initial.finish()?;

    if mechanism != SCRAM_SHA_256 {
        return Err(Error::authentication(format!(
            "unsupported SASL mechanism {mechanism:?}; supported: {SCRAM_SHA_256}"
        )));
    }
    if client_first.is_empty() {
        return Err(Error::binary_protocol("empty SASL initial payload"));
    }

    let (exchange, server_first) = ScramExchange::begin(verifier, &client_first)?;
    server::auth_sasl_continue(out, server_first.as_bytes());
    out.flush_to(stream).await?;

    let mut response = reader.wait_for_message().await?;
    if response.mtype() != MSG_AUTH_SASL_RESPONSE {
        return Err(Error::binary_protocol(format!(
            "expected SASL response, got '{}'",
            response.mtype() as char
        )));
    }
    let client_final = response.get_len_bytes()?;
    response.finish()?;

    let server_final = exchange.verify_final(&client_final)?;
    server::auth_sasl_final(out, server_final.as_bytes());
    Ok(())
}

/// The JWT bearer path: token from the transport auth data if present,
/// else from the `secret_key` connection parameter.
pub fn authenticate_jwt<T: Tenant>(
    tenant: &T,
    auth_data: Option<&str>,
    secret_key_param: Option<&str>,
    user: &str,
    dbname: &str,
) -> Result<(), Error> {
    let raw = jwt::extract_token(auth_data, secret_key_param)?;
    let (token, version) = jwt::strip_token_prefix(raw)?;
    let claims = jwt::validate_token(tenant.jwt_keys(), token)?;
    tenant.check_jwt(&claims)?;
    let scopes = jwt::parse_scopes(&claims, version)?;
    jwt::check_authz(&scopes, tenant.instance_name(), dbname, user)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use hmac::{Hmac, Mac};
    use sha2::{Digest, Sha256};
    use tokio::io::AsyncWriteExt;

    use crate::messages::codec::MessageBuffer;
    use crate::messages::constants::{AUTH_SASL, AUTH_SASL_CONTINUE, AUTH_SASL_FINAL};

    fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
        let mut block = salt.to_vec();
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

    fn frame(mtype: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![mtype];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn len_bytes(data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as i32).to_be_bytes().to_vec();
        out.extend_from_slice(data);
        out
    }

    fn scram_attr(message: &str, key: char) -> String {
        message
            .split(',')
            .find(|p| p.starts_with(&format!("{key}=")))
            .unwrap()[2..]
            .to_string()
    }

    #[tokio::test]
    async fn test_full_sasl_exchange_over_duplex() {
        let salt = b"0123456789abcdef";
        let iterations = 512;
        let verifier = ScramVerifier::from_password("sekret", salt, iterations).unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let (server_read, mut server_write) = tokio::io::split(server);
        let mut reader = FrameReader::new(server_read);
        let mut out = MessageWriter::new();

        let server_task = async {
            authenticate_sasl(&mut reader, &mut out, &mut server_write, verifier).await
        };

        let client_task = async {
            let mut inbound = MessageBuffer::new();
            let mut buf = [0u8; 1024];
            use tokio::io::AsyncReadExt;

            // Read the SASL method advertisement.
            let mut msg = loop {
                if let Some(m) = inbound.take_message().unwrap() {
                    break m;
                }
                let n = client.read(&mut buf).await.unwrap();
                inbound.feed(&buf[..n]);
            };
            assert_eq!(msg.get_i32().unwrap() as u32, AUTH_SASL);
            assert_eq!(msg.get_i32().unwrap(), 1);
            assert_eq!(msg.get_utf8().unwrap(), SCRAM_SHA_256);

            // Send client-first.
            let client_first_bare = "n=edgedb,r=nonceclient";
            let mut body = len_bytes(SCRAM_SHA_256.as_bytes());
            body.extend_from_slice(&len_bytes(format!("n,,{client_first_bare}").as_bytes()));
            client
                .write_all(&frame(MSG_AUTH_SASL_INITIAL, &body))
                .await
                .unwrap();

            // Read server-first.
            let mut msg = loop {
                if let Some(m) = inbound.take_message().unwrap() {
                    break m;
                }
                let n = client.read(&mut buf).await.unwrap();
                inbound.feed(&buf[..n]);
            };
            assert_eq!(msg.get_i32().unwrap() as u32, AUTH_SASL_CONTINUE);
            let server_first =
                String::from_utf8(msg.get_len_bytes().unwrap().to_vec()).unwrap();
            let nonce = scram_attr(&server_first, 'r');

            // Compute and send the proof.
            let without_proof = format!("c=biws,r={nonce}");
            let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
            let salted = hi(b"sekret", salt, iterations);
            let client_key = hmac(&salted, b"Client Key");
            let stored_key: [u8; 32] = Sha256::digest(client_key).into();
            let signature = hmac(&stored_key, auth_message.as_bytes());
            let mut proof = [0u8; 32];
            for i in 0..32 {
                proof[i] = client_key[i] ^ signature[i];
            }
            let client_final = format!("{without_proof},p={}", B64.encode(proof));
            client
                .write_all(&frame(MSG_AUTH_SASL_RESPONSE, &len_bytes(client_final.as_bytes())))
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(server_task, client_task);
        result.unwrap();

        // The buffered (unflushed) frame is the SASLFinal.
        let mut inbound = MessageBuffer::new();
        inbound.feed(&out.take());
        let mut msg = inbound.take_message().unwrap().unwrap();
        assert_eq!(msg.get_i32().unwrap() as u32, AUTH_SASL_FINAL);
        let server_final = msg.get_len_bytes().unwrap();
        assert!(server_final.starts_with(b"v="));
    }
}
