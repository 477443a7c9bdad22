use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use mender_api::auth::{AUTH_REQUESTS_PATH, SIGNATURE_HEADER};
use mender_api::AuthRequest;
use mender_artifact::rsa::RsaPrivateKey;
use mender_artifact::verify_sig;
use reqwest::StatusCode;
use tokio::sync::{oneshot, watch};

use crate::config::MenderConfig;
use crate::error::{AuthError, ClientError, Result};
use crate::identity;

/// A valid bearer and the server it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub token: String,
    pub server_url: String,
}

type AuthOutcome = std::result::Result<AuthData, AuthError>;

#[derive(Default)]
struct AuthState {
    cached: Option<AuthData>,
    fetch_in_progress: bool,
    waiters: VecDeque<oneshot::Sender<AuthOutcome>>,
}

struct Inner {
    servers: Vec<String>,
    tenant_token: String,
    identity_script: PathBuf,
    private_key: RsaPrivateKey,
    public_key_pem: String,
    auth_timeout: Duration,
    client: reqwest::Client,

    state: Mutex<AuthState>,
    notify: watch::Sender<(String, String)>,
}

/// Single-flight token coordinator. All outbound requests go through
/// [`Authenticator::with_token`]; concurrent demands while no token is
/// cached share one acquisition and are completed in registration order.
///
/// Cheap to clone; all clones share the same cache and subscription channel.
#[derive(Clone)]
pub struct Authenticator {
    inner: Arc<Inner>,
}

impl Authenticator {
    pub fn new(config: &MenderConfig) -> Result<Self> {
        let private_key = verify_sig::private_key_from_file(&config.paths.key_file)?;
        let public_key_pem = verify_sig::public_key_pem(&private_key)?;
        let (notify, _) = watch::channel((String::new(), String::new()));

        Ok(Self {
            inner: Arc::new(Inner {
                servers: config.servers.clone(),
                tenant_token: config.tenant_token.clone(),
                identity_script: config.identity_script.clone(),
                private_key,
                public_key_pem,
                auth_timeout: config.auth_timeout,
                client: reqwest::Client::new(),
                state: Mutex::new(AuthState::default()),
                notify,
            }),
        })
    }

    /// Publishes `(token, server_url)` on every successful acquisition, and
    /// the empty pair on expiry.
    pub fn subscribe(&self) -> watch::Receiver<(String, String)> {
        self.inner.notify.subscribe()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AuthState> {
        self.inner.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Resolves to a valid `(token, server_url)` or an authentication error.
    /// If an acquisition is already in flight the caller joins its outcome.
    pub async fn with_token(&self) -> AuthOutcome {
        let receiver = {
            let mut state = self.lock_state();
            if let Some(data) = &state.cached {
                return Ok(data.clone());
            }

            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);

            if !state.fetch_in_progress {
                state.fetch_in_progress = true;
                let this = self.clone();
                tokio::spawn(async move { this.fetch_and_complete().await });
            }
            receiver
        };

        receiver
            .await
            .unwrap_or_else(|_| Err(AuthError::Setup("authentication task vanished".to_string())))
    }

    /// Drops the cached token. Idempotent; the subscription sees the empty
    /// pair at most once per expiry.
    pub fn expire_token(&self) {
        let expired = self.lock_state().cached.take().is_some();
        if expired {
            info!("cached authentication token expired");
            let _ = self.inner.notify.send((String::new(), String::new()));
        }
    }

    /// A consumer reports a 401 from a server call: the cached token is
    /// expired and a fresh acquisition joined.
    pub async fn handle_unauthorized(&self) -> AuthOutcome {
        self.expire_token();
        self.with_token().await
    }

    async fn fetch_and_complete(self) {
        let result = match tokio::time::timeout(self.inner.auth_timeout, self.fetch_token()).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::Timeout),
        };

        let waiters = {
            let mut state = self.lock_state();
            state.fetch_in_progress = false;
            if let Ok(data) = &result {
                state.cached = Some(data.clone());
            }
            std::mem::take(&mut state.waiters)
        };

        match &result {
            Ok(data) => {
                info!("successfully received new authorization data");
                let _ = self
                    .inner
                    .notify
                    .send((data.token.clone(), data.server_url.clone()));
            }
            Err(err) => error!("failed to fetch new token: {err}"),
        }

        // Pending actions complete in registration order.
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn fetch_token(&self) -> AuthOutcome {
        let inner = &self.inner;
        if inner.servers.is_empty() {
            return Err(AuthError::Setup("no server configured".to_string()));
        }

        let identity_data = identity::collect(&inner.identity_script)
            .await
            .map_err(|err| AuthError::Setup(err.to_string()))?;

        let request = AuthRequest {
            id_data: identity::to_json(&identity_data),
            pubkey: inner.public_key_pem.clone(),
            tenant_token: inner.tenant_token.clone(),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|err| AuthError::Setup(err.to_string()))?;

        let signature = verify_sig::sign_rsa_pkcs(&body, &inner.private_key)
            .map_err(|err| AuthError::Setup(err.to_string()))?;
        let signature = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, signature);

        let mut last_error = String::from("no server answered");
        for server in &inner.servers {
            let url = format!("{server}{AUTH_REQUESTS_PATH}");
            debug!("making an authentication request to {url}");

            let response = inner
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header(SIGNATURE_HEADER, &signature)
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    match response.text().await {
                        Ok(token) => {
                            return Ok(AuthData {
                                token,
                                server_url: server.clone(),
                            });
                        }
                        Err(err) => last_error = format!("{url}: {err}"),
                    }
                }
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    // The server knowingly rejected this device; trying the
                    // same credentials elsewhere will not help.
                    return Err(AuthError::Authentication(format!(
                        "server {server} rejected the authentication request"
                    )));
                }
                Ok(response) => {
                    last_error = format!("{url}: unexpected status {}", response.status());
                }
                Err(err) => last_error = format!("{url}: {err}"),
            }
        }

        Err(AuthError::Transport(last_error))
    }
}

/// Sends an authenticated request, transparently re-authenticating once when
/// the server answers 401. A second 401 surfaces as `Unauthorized`.
pub async fn authorized_request<F, Fut>(
    auth: &Authenticator,
    mut send: F,
) -> Result<reqwest::Response>
where
    F: FnMut(AuthData) -> Fut,
    Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
{
    let data = auth.with_token().await?;
    let response = send(data).await?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return Ok(response);
    }

    debug!("request returned 401, re-authenticating once");
    let data = auth.handle_unauthorized().await?;
    let response = send(data).await?;
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized);
    }
    Ok(response)
}
