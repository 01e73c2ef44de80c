//! Broker login over HTTP
//!
//! The interactive login (user id, password, TOTP) runs behind a login bridge
//! that returns a one-time request token. The request token is then exchanged
//! with the broker API for a session token, signed with the API secret.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use ring::hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::agents::{BrokerGateway, BrokerLoginError};
use crate::config::AuthAgentConfig;
use crate::domain::{BrokerCredential, BrokerIdentity, SessionToken};
use crate::error::{OrraError, Result};

const REQUEST_TIMEOUT_SECS: u64 = 60;
const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;

/// Decode an RFC 4648 base32 secret, ignoring padding, spaces and case
pub fn decode_base32(input: &str) -> Option<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::with_capacity(input.len() * 5 / 8));
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    for c in input.chars().filter(|c| !c.is_whitespace() && *c != '=') {
        let value = match c.to_ascii_uppercase() {
            ch @ 'A'..='Z' => ch as u64 - 'A' as u64,
            ch @ '2'..='7' => ch as u64 - '2' as u64 + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// RFC 6238 time-based one-time password (HMAC-SHA1, 30 s step, 6 digits)
pub fn totp_at(secret_base32: &str, unix_secs: u64) -> Option<Zeroizing<String>> {
    let key_bytes = decode_base32(secret_base32)?;
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &key_bytes);
    let counter = (unix_secs / TOTP_STEP_SECS).to_be_bytes();
    let tag = hmac::sign(&key, &counter);
    let digest = tag.as_ref();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]) % 10u32.pow(TOTP_DIGITS);
    Some(Zeroizing::new(format!(
        "{:0width$}",
        code,
        width = TOTP_DIGITS as usize
    )))
}

/// `hex(sha256(api_key + request_token + api_secret))`
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Serialize)]
struct BridgeLoginRequest<'a> {
    api_key: &'a str,
    user_id: &'a str,
    password: &'a str,
    totp: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct BridgeLoginResponse {
    #[serde(default)]
    request_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: Option<SessionData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    access_token: String,
}

/// Map a non-success HTTP status and broker error type to a login error
fn classify_failure(
    status: StatusCode,
    error_type: Option<&str>,
    message: &str,
) -> BrokerLoginError {
    let detail = match error_type {
        Some(kind) => format!("{}: {}", kind, message),
        None => format!("HTTP {}: {}", status, message),
    };
    let kind = error_type.unwrap_or_default().to_ascii_lowercase();
    if kind.contains("twofa") || kind.contains("twofactor") || kind.contains("totp") {
        return BrokerLoginError::TwoFactor(detail);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return BrokerLoginError::Transient(detail);
    }
    if status.is_client_error() || kind.contains("token") || kind.contains("credential") {
        return BrokerLoginError::Rejected(detail);
    }
    BrokerLoginError::Transient(detail)
}

fn transport(e: reqwest::Error) -> BrokerLoginError {
    BrokerLoginError::Transient(e.to_string())
}

/// Login bridge plus session exchange
pub struct HttpBrokerGateway {
    client: Client,
    login_bridge_url: String,
    broker_api_url: String,
}

impl HttpBrokerGateway {
    pub fn new(login_bridge_url: &str, broker_api_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            login_bridge_url: login_bridge_url.to_string(),
            broker_api_url: broker_api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(cfg: &AuthAgentConfig) -> Result<Self> {
        if cfg.login_bridge_url.trim().is_empty() {
            return Err(OrraError::Configuration(
                "auth.login_bridge_url is required".to_string(),
            ));
        }
        Self::new(&cfg.login_bridge_url, &cfg.broker_api_url)
    }

    async fn request_token(
        &self,
        credential: &BrokerCredential,
        identity: &BrokerIdentity,
    ) -> std::result::Result<BridgeLoginResponse, BrokerLoginError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let totp = totp_at(&credential.totp_secret, now).ok_or_else(|| {
            BrokerLoginError::TwoFactor("TOTP secret is not valid base32".to_string())
        })?;

        let resp = self
            .client
            .post(&self.login_bridge_url)
            .json(&BridgeLoginRequest {
                api_key: &credential.api_key,
                user_id: &identity.user_id,
                password: identity.password.as_str(),
                totp: totp.as_str(),
            })
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let body: BridgeLoginResponse = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_failure(
                status,
                body.error_type.as_deref(),
                body.message.as_deref().unwrap_or("login bridge error"),
            ));
        }
        Ok(body)
    }

    async fn exchange(
        &self,
        credential: &BrokerCredential,
        request_token: &str,
    ) -> std::result::Result<SessionToken, BrokerLoginError> {
        let checksum =
            session_checksum(&credential.api_key, request_token, &credential.api_secret);
        let resp = self
            .client
            .post(format!("{}/session/token", self.broker_api_url))
            .header("X-Kite-Version", "3")
            .form(&[
                ("api_key", credential.api_key.as_str()),
                ("request_token", request_token),
                ("checksum", checksum.as_str()),
            ])
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let body: SessionResponse = resp.json().await.unwrap_or_default();
        match body.data {
            Some(data) if status.is_success() && body.status == "success" => {
                Ok(SessionToken::new(data.access_token))
            }
            _ => Err(classify_failure(
                status,
                body.error_type.as_deref(),
                body.message.as_deref().unwrap_or("session exchange failed"),
            )),
        }
    }
}

#[async_trait]
impl BrokerGateway for HttpBrokerGateway {
    #[instrument(skip_all, fields(user_id = %identity.user_id))]
    async fn login(
        &self,
        credential: &BrokerCredential,
        identity: &BrokerIdentity,
    ) -> std::result::Result<SessionToken, BrokerLoginError> {
        let bridge = self.request_token(credential, identity).await?;

        if let Some(access_token) = bridge.access_token.filter(|t| !t.is_empty()) {
            debug!("Login bridge returned a session token directly");
            return Ok(SessionToken::new(access_token));
        }

        let Some(request_token) = bridge.request_token.filter(|t| !t.is_empty()) else {
            warn!("Login bridge response carried no token");
            return Err(BrokerLoginError::Transient(
                "login bridge returned no request token".to_string(),
            ));
        };
        self.exchange(credential, &request_token).await
    }
}
