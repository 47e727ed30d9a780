//! Blocking HTTP client for the Tado API: the handful of endpoints the
//! controller reads and writes.
//!
//! Authentication
//! - Refresh-token grant against the Tado login service. Tado rotates the
//!   refresh token on every grant; the new one is written back to the token
//!   file (when configured) so a restart does not need a fresh device login.
//! - A 401 on any call forces one refresh and one retry.
//!
//! Every request is bounded by the agent's global timeout.

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::tado::*;

const BASE_URL: &str = "https://my.tado.com/api/v2";
const OAUTH_TOKEN_URL: &str = "https://login.tado.com/oauth2/token";
const OAUTH_CLIENT_ID: &str = "1bb50063-6b0c-4d11-bd99-387f4a91cc46";
/// Refresh this long before the access token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

type HttpResponse = http::Response<ureq::Body>;

#[derive(Debug)]
pub enum TadoClientError {
    Timeout,
    Transport(String),
    Http { status: u16, message: String },
    Json(serde_json::Error),
    Auth(String),
}

impl core::fmt::Display for TadoClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TadoClientError::Timeout => write!(f, "request timed out"),
            TadoClientError::Transport(s) => write!(f, "transport error: {}", s),
            TadoClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            TadoClientError::Json(e) => write!(f, "json error: {}", e),
            TadoClientError::Auth(e) => write!(f, "auth error: {}", e),
        }
    }
}

impl std::error::Error for TadoClientError {}

impl From<serde_json::Error> for TadoClientError {
    fn from(value: serde_json::Error) -> Self {
        TadoClientError::Json(value)
    }
}

impl From<ureq::Error> for TadoClientError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Timeout(_) => TadoClientError::Timeout,
            other => TadoClientError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct OAuthToken {
    access_token: String,
    expires_at: Instant,
}

impl OAuthToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug)]
struct OAuthState {
    token: Option<OAuthToken>,
    refresh_token: String,
}

pub struct TadoClient {
    agent: ureq::Agent,
    user_agent: String,
    refresh_token_file: Option<PathBuf>,
    oauth: Mutex<OAuthState>,
}

fn user_agent(firefox_version: &str) -> String {
    format!(
        "Mozilla/5.0 (X11; Linux x86_64; rv:{v}) Gecko/20100101 Firefox/{v}",
        v = firefox_version
    )
}

fn check_status(mut resp: HttpResponse) -> Result<HttpResponse, TadoClientError> {
    let status = resp.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(resp);
    }
    let message = resp
        .body_mut()
        .read_to_string()
        .unwrap_or_else(|_| String::from("<no body>"));
    Err(TadoClientError::Http { status, message })
}

impl TadoClient {
    /// Builds the agent and performs the first token grant, so a bad token
    /// fails at startup rather than on the first tick.
    pub fn new(
        refresh_token: &str,
        firefox_version: &str,
        refresh_token_file: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, TadoClientError> {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        let client = TadoClient {
            agent: ureq::Agent::new_with_config(config),
            user_agent: user_agent(firefox_version),
            refresh_token_file,
            oauth: Mutex::new(OAuthState {
                token: None,
                refresh_token: refresh_token.to_string(),
            }),
        };
        client.bearer(true)?;
        Ok(client)
    }

    fn url(path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", BASE_URL, path)
        } else {
            format!("{}/{}", BASE_URL, path)
        }
    }

    fn lock_oauth(&self) -> Result<MutexGuard<'_, OAuthState>, TadoClientError> {
        self.oauth
            .lock()
            .map_err(|_| TadoClientError::Auth("token lock poisoned".to_string()))
    }

    fn refresh_grant(&self, state: &mut OAuthState) -> Result<(), TadoClientError> {
        let resp = self
            .agent
            .post(OAUTH_TOKEN_URL)
            .header("Accept", "application/json")
            .header("User-Agent", &self.user_agent)
            .send_form([
                ("client_id", OAUTH_CLIENT_ID),
                ("grant_type", "refresh_token"),
                ("refresh_token", state.refresh_token.as_str()),
            ])?;
        let resp = check_status(resp).map_err(|e| TadoClientError::Auth(e.to_string()))?;
        let TokenResponse {
            access_token,
            expires_in,
            refresh_token,
        } = serde_json::from_reader(resp.into_body().into_reader())?;

        state.token = Some(OAuthToken {
            access_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        if let Some(rotated) = refresh_token
            && rotated != state.refresh_token
        {
            state.refresh_token = rotated;
            self.persist_refresh_token(&state.refresh_token);
        }
        debug!("Tado access token refreshed (valid {}s)", expires_in);
        Ok(())
    }

    fn persist_refresh_token(&self, token: &str) {
        let Some(path) = &self.refresh_token_file else {
            return;
        };
        match fs::write(path, token) {
            Ok(()) => info!("Rotated Tado refresh token saved to {}", path.display()),
            Err(e) => warn!("Could not save rotated refresh token to {}: {}", path.display(), e),
        }
    }

    fn bearer(&self, force_refresh: bool) -> Result<String, TadoClientError> {
        let mut state = self.lock_oauth()?;
        let fresh = state.token.as_ref().filter(|t| t.is_fresh(Instant::now()));
        if let Some(token) = fresh
            && !force_refresh
        {
            return Ok(token.access_token.clone());
        }
        self.refresh_grant(&mut state)?;
        state
            .token
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| TadoClientError::Auth("token grant returned no access token".to_string()))
    }

    /// Run `call` with a bearer token; on 401 refresh once and retry.
    fn authed<F>(&self, call: F) -> Result<HttpResponse, TadoClientError>
    where
        F: Fn(&str) -> Result<HttpResponse, ureq::Error>,
    {
        let token = self.bearer(false)?;
        let resp = call(&format!("Bearer {}", token))?;
        if resp.status().as_u16() != 401 {
            return check_status(resp);
        }
        warn!("Tado API returned 401; refreshing token and retrying once");
        let token = self.bearer(true)?;
        check_status(call(&format!("Bearer {}", token))?)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TadoClientError> {
        let url = Self::url(path);
        let resp = self.authed(|auth| {
            self.agent
                .get(&url)
                .header("Accept", "application/json")
                .header("User-Agent", &self.user_agent)
                .header("Authorization", auth)
                .call()
        })?;
        Ok(serde_json::from_reader(resp.into_body().into_reader())?)
    }

    fn put_json<B: Serialize>(&self, path: &str, body: &B) -> Result<HttpResponse, TadoClientError> {
        let url = Self::url(path);
        self.authed(|auth| {
            self.agent
                .put(&url)
                .header("Accept", "application/json")
                .header("User-Agent", &self.user_agent)
                .header("Authorization", auth)
                .send_json(body)
        })
    }

    pub fn get_zone_state(&self, home_id: HomeId, zone_id: ZoneId) -> Result<ZoneState, TadoClientError> {
        self.get_json(&format!("/homes/{}/zones/{}/state", home_id.0, zone_id.0))
    }

    pub fn put_zone_overlay(
        &self,
        home_id: HomeId,
        zone_id: ZoneId,
        overlay: &ZoneOverlay,
    ) -> Result<ZoneOverlay, TadoClientError> {
        let resp = self.put_json(&format!("/homes/{}/zones/{}/overlay", home_id.0, zone_id.0), overlay)?;
        Ok(serde_json::from_reader(resp.into_body().into_reader())?)
    }

    pub fn get_mobile_devices(&self, home_id: HomeId) -> Result<Vec<MobileDevice>, TadoClientError> {
        self.get_json(&format!("/homes/{}/mobileDevices", home_id.0))
    }

    pub fn put_presence_lock(&self, home_id: HomeId, lock: &PresenceLock) -> Result<(), TadoClientError> {
        self.put_json(&format!("/homes/{}/presenceLock", home_id.0), lock)?;
        Ok(())
    }
}
