//! SCRAM-SHA-256 client exchange (RFC 5802 / RFC 7677).
//!
//! The exchange is modelled as a three-state machine driven by the startup
//! loop in [`PgConnection`](super::connection::PgConnection):
//! `Initial -> AwaitingFinal -> Done`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name announced in SASLInitialResponse.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// Failures while running the SCRAM exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    NotUtf8,
    #[error("server-first-message is missing attribute '{0}'")]
    MissingAttribute(char),
    #[error("server-first-message has a malformed attribute '{0}'")]
    MalformedAttribute(char),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature does not match")]
    BadServerSignature,
    #[error("SCRAM message received out of order")]
    OutOfOrder,
    #[error("key derivation failed")]
    Crypto,
}

enum Stage {
    Initial,
    AwaitingFinal {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// Client side of one SCRAM-SHA-256 authentication.
pub struct ScramSha256 {
    password: String,
    client_first_bare: String,
    nonce: String,
    stage: Stage,
}

impl ScramSha256 {
    /// Start an exchange with a fresh random nonce.
    ///
    /// PostgreSQL ignores the SCRAM user name (it uses the startup user), so
    /// the bare message carries an empty `n=`.
    pub fn new(password: &str) -> Self {
        let mut raw = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::with_nonce(password, BASE64.encode(raw))
    }

    fn with_nonce(password: &str, nonce: String) -> Self {
        Self {
            password: password.to_string(),
            client_first_bare: format!("n=,r={}", nonce),
            nonce,
            stage: Stage::Initial,
        }
    }

    /// client-first-message, including the GS2 header (no channel binding).
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consume server-first-message and produce client-final-message.
    pub fn handle_server_first(&mut self, data: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.stage, Stage::Initial) {
            return Err(ScramError::OutOfOrder);
        }
        let server_first = std::str::from_utf8(data).map_err(|_| ScramError::NotUtf8)?;

        let nonce = attribute(server_first, 'r')?;
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(ScramError::NonceMismatch);
        }
        let salt = BASE64
            .decode(attribute(server_first, 's')?)
            .map_err(|_| ScramError::MalformedAttribute('s'))?;
        let iterations: u32 = attribute(server_first, 'i')?
            .parse()
            .map_err(|_| ScramError::MalformedAttribute('i'))?;

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|_| ScramError::Crypto)?;

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.stage = Stage::AwaitingFinal {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify server-final-message.
    pub fn handle_server_final(&mut self, data: &[u8]) -> Result<(), ScramError> {
        let Stage::AwaitingFinal {
            salted_password,
            auth_message,
        } = &self.stage
        else {
            return Err(ScramError::OutOfOrder);
        };
        let text = std::str::from_utf8(data).map_err(|_| ScramError::NotUtf8)?;
        let verifier = BASE64
            .decode(attribute(text, 'v')?)
            .map_err(|_| ScramError::MalformedAttribute('v'))?;

        let server_key = hmac(salted_password, b"Server Key")?;
        let expected = hmac(&server_key, auth_message.as_bytes())?;
        if verifier != expected {
            return Err(ScramError::BadServerSignature);
        }
        self.stage = Stage::Done;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }
}

fn attribute(message: &str, key: char) -> Result<&str, ScramError> {
    message
        .split(',')
        .find_map(|part| {
            let mut chars = part.chars();
            (chars.next() == Some(key) && chars.next() == Some('=')).then(|| &part[2..])
        })
        .ok_or(ScramError::MissingAttribute(key))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| ScramError::Crypto)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
