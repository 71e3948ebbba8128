//! Remote API Connection
//!
//! Holds the credentials, the session token and the rotating secret key that
//! every signed request depends on. The secret advances after every call, so
//! signing state is connection-wide and guarded by a mutex.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::{Client, Url};
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use super::errors::ApiError;
use super::retry::TokenSession;
use super::types::{decode_response, SessionTokenPayload};
use crate::cache::{binary_to_hex, hash_reader, HashAlgorithm};

/// HTTP client timeout for API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads have no total deadline, only connect and idle-read limits
const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Multiplier and modulus of the secret key sequence
const SECRET_MULTIPLIER: u64 = 16807;
const SECRET_MODULUS: u64 = 2147483647;

/// Account credentials used to negotiate session tokens
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub app_id: String,
    pub api_key: String,
}

impl Credentials {
    /// SHA-1 over email, password, application id and api key
    fn signature(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.email.as_bytes());
        hasher.update(self.password.as_bytes());
        hasher.update(self.app_id.as_bytes());
        hasher.update(self.api_key.as_bytes());
        binary_to_hex(&hasher.finalize())
    }
}

/// Connection-level flags
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionFlags {
    /// Skip TLS certificate verification
    pub lazy_ssl: bool,
}

/// Negotiated session state (refreshable on token errors)
struct SessionState {
    session_token: String,
    secret_key: u64,
    time: String,
}

/// A request URL carrying the session token and its signature
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub endpoint: String,
    pub url: String,
}

/// Connection to the remote API
pub struct Connection {
    /// HTTP client for making requests
    http_client: Client,
    /// HTTP client for file content transfers
    download_client: Client,
    /// API base, e.g. https://host/api/1.3/
    api_base: Url,
    /// Stored credentials for token negotiation
    credentials: Credentials,
    /// Current session (None until the first token is negotiated)
    session: Mutex<Option<SessionState>>,
    /// Serializes signed calls and token refreshes on this connection
    call_lock: tokio::sync::Mutex<()>,
    /// Attempts per remote operation
    max_retries: u32,
    flags: ConnectionFlags,
}

impl Connection {
    /// Create a connection and negotiate the first session token
    pub async fn connect(
        api_base: &str,
        credentials: Credentials,
        max_retries: u32,
        flags: ConnectionFlags,
    ) -> Result<Self, ApiError> {
        let conn = Self::new(api_base, credentials, max_retries, flags)?;
        conn.negotiate_token().await?;
        Ok(conn)
    }

    /// Create a connection without a session token
    pub fn new(
        api_base: &str,
        credentials: Credentials,
        max_retries: u32,
        flags: ConnectionFlags,
    ) -> Result<Self, ApiError> {
        let api_base = Url::parse(api_base)
            .map_err(|e| ApiError::InvalidArgument(format!("bad API base {}: {}", api_base, e)))?;

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(flags.lazy_ssl)
            .build()
            .map_err(ApiError::from)?;

        let download_client = Client::builder()
            .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
            .read_timeout(DOWNLOAD_READ_TIMEOUT)
            .danger_accept_invalid_certs(flags.lazy_ssl)
            .build()
            .map_err(ApiError::from)?;

        Ok(Self {
            http_client,
            download_client,
            api_base,
            credentials,
            session: Mutex::new(None),
            call_lock: tokio::sync::Mutex::new(()),
            max_retries,
            flags,
        })
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub fn download_client(&self) -> &Client {
        &self.download_client
    }

    /// Negotiate a fresh session token and secret key
    async fn negotiate_token(&self) -> Result<(), ApiError> {
        info!("Negotiating session token...");

        let mut url = self
            .api_base
            .join("user/get_session_token.php")
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("email", &self.credentials.email)
            .append_pair("password", &self.credentials.password)
            .append_pair("application_id", &self.credentials.app_id)
            .append_pair("signature", &self.credentials.signature())
            .append_pair("token_version", "2")
            .append_pair("response_format", "json");

        let response = self.http_client.get(url).send().await?;
        let body = response.text().await?;
        let payload: SessionTokenPayload = decode_response(&body, "user/get_session_token")?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        *session = Some(SessionState {
            session_token: payload.session_token,
            secret_key: payload.secret_key,
            time: payload.time,
        });

        info!("Session token negotiated");
        Ok(())
    }

    /// Execute a signed request and return the response body
    ///
    /// # Arguments
    /// * `request` - Signed request from [`TokenSession::create_signed_request`]
    /// * `body` - Optional POST payload; GET when absent
    pub async fn execute(
        &self,
        request: &SignedRequest,
        body: Option<Vec<u8>>,
    ) -> Result<String, ApiError> {
        debug!(endpoint = %request.endpoint, "Executing signed request");

        let builder = match body {
            Some(bytes) => self
                .http_client
                .post(&request.url)
                .header("Content-Type", "application/octet-stream")
                .body(bytes),
            None => self.http_client.get(&request.url),
        };

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            // Error responses still carry the JSON envelope with an error code
            if let Err(api_err) =
                decode_response::<serde_json::Value>(&text, &request.endpoint)
            {
                if !matches!(api_err, ApiError::Decode(_)) {
                    return Err(api_err);
                }
            }
            return Err(ApiError::Http(status.as_u16(), text));
        }

        Ok(text)
    }
}

impl TokenSession for Connection {
    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn call_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.call_lock
    }

    fn create_signed_request(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<SignedRequest, ApiError> {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let state = session
            .as_ref()
            .ok_or_else(|| ApiError::Signing("no session token".to_string()))?;

        let mut uri = format!(
            "{}{}?session_token={}",
            self.api_base.path(),
            endpoint,
            state.session_token
        );
        for (key, value) in query {
            uri.push('&');
            uri.push_str(key);
            uri.push('=');
            uri.push_str(&urlencoding::encode(value));
        }

        let signature = sign_uri(state.secret_key, &state.time, &uri)?;
        let origin = self.api_base.origin().ascii_serialization();

        Ok(SignedRequest {
            endpoint: endpoint.to_string(),
            url: format!("{}{}&signature={}", origin, uri, signature),
        })
    }

    fn update_secret_key(&self) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = session.as_mut() {
            state.secret_key = next_secret_key(state.secret_key);
        }
    }

    async fn refresh_token(&self) -> Result<(), ApiError> {
        self.negotiate_token().await
    }
}

/// Advance the rotating secret key by one step
pub fn next_secret_key(secret_key: u64) -> u64 {
    (secret_key * SECRET_MULTIPLIER) % SECRET_MODULUS
}

/// MD5 over (secret mod 256) ‖ time ‖ uri
pub fn sign_uri(secret_key: u64, time: &str, uri: &str) -> Result<String, ApiError> {
    let material = format!("{}{}{}", secret_key % 256, time, uri);
    let (digest, _) = hash_reader(material.as_bytes(), HashAlgorithm::Md5, None)
        .map_err(|e| ApiError::Signing(e.to_string()))?;
    Ok(binary_to_hex(&digest))
}
