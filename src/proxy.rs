use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use log::{debug, error, info};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::error::{ClientError, Result};

// Forwarded bodies are API requests, not artifacts; keep them bounded.
const MAX_FORWARD_BODY: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct ProxyState {
    auth: Authenticator,
    client: reqwest::Client,
}

/// Local HTTP listener that forwards every request to the current server
/// and injects the bearer token. Consumers that cannot set their own
/// Authorization header talk to this instead of the server directly.
///
/// The local URL survives token changes; in-flight forwards are canceled
/// when the token rotates.
pub struct AuthProxy {
    local_url: String,
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl AuthProxy {
    pub async fn spawn(auth: Authenticator) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let state = ProxyState {
            auth,
            client: reqwest::Client::new(),
        };
        let app = axum::Router::new().fallback(forward).with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                error!("authenticating proxy terminated: {err}");
            }
        });

        info!("authenticating proxy listening on 127.0.0.1:{port}");
        Ok(Self {
            local_url: format!("http://127.0.0.1:{port}"),
            port,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn url(&self) -> &str {
        &self.local_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn shutdown(mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn forward(State(state): State<ProxyState>, request: axum::extract::Request) -> Response {
    match do_forward(state, request).await {
        Ok(response) => response,
        Err(err) => {
            error!("failed to forward request: {err}");
            Response::builder()
                .status(502)
                .body(Body::from(err.to_string()))
                .unwrap_or_default()
        }
    }
}

async fn do_forward(state: ProxyState, request: axum::extract::Request) -> Result<Response> {
    let auth_data = state
        .auth
        .with_token()
        .await
        .map_err(ClientError::from)?;
    let mut token_updates = state.auth.subscribe();
    token_updates.mark_unchanged();

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_FORWARD_BODY)
        .await
        .map_err(|err| ClientError::Process(format!("failed to read request body: {err}")))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{path_and_query}", auth_data.server_url);
    debug!("forwarding {} {path_and_query} to {url}", parts.method);

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|_| ClientError::Process(format!("invalid method: {}", parts.method)))?;

    let mut outgoing = state.client.request(method, &url).body(body.to_vec());
    for (name, value) in &parts.headers {
        let name = name.as_str();
        if matches!(name, "host" | "authorization" | "content-length") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outgoing = outgoing.header(name, value);
        }
    }
    outgoing = outgoing.bearer_auth(&auth_data.token);

    // A token change invalidates this forward; the consumer retries against
    // the same local URL and picks up the fresh token.
    let upstream = tokio::select! {
        response = outgoing.send() => response?,
        _ = token_updates.changed() => {
            return Err(ClientError::Process(
                "authentication token changed, forward canceled".to_string(),
            ));
        }
    };

    let mut builder = Response::builder().status(upstream.status().as_u16());
    for (name, value) in upstream.headers() {
        if matches!(name.as_str(), "transfer-encoding" | "connection") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let bytes = upstream.bytes().await?;
    builder
        .body(Body::from(bytes))
        .map_err(|err| ClientError::Process(format!("failed to build response: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRIVKEY_PEM: &str = include_str!("testdata/private_key_test_pkcs8.pem");

    async fn test_auth(server: &MockServer, tmp: &std::path::Path) -> Authenticator {
        Mock::given(method("POST"))
            .and(url_path(mender_api::auth::AUTH_REQUESTS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("JWT-TOKEN"))
            .mount(server)
            .await;

        let paths = crate::config::Paths::from_dirs(
            tmp.join("etc"),
            tmp.join("share"),
            tmp.join("datastore"),
        );
        std::fs::create_dir_all(&paths.datastore_dir).unwrap();
        std::fs::write(&paths.key_file, PRIVKEY_PEM).unwrap();
        let script = tmp.join("identity");
        std::fs::write(&script, "#!/bin/sh\necho mac=aa\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = crate::config::MenderConfig::load_from(paths).unwrap();
        config.servers = vec![server.uri()];
        config.identity_script = script;
        config.auth_timeout = Duration::from_secs(5);
        Authenticator::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_forward_injects_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/api/devices/v1/deployments/device/deployments/next"))
            .and(header("Authorization", "Bearer JWT-TOKEN"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let auth = test_auth(&server, tmp.path()).await;
        let proxy = AuthProxy::spawn(auth).await.unwrap();

        let client = reqwest::Client::new();
        let response = client
            .get(format!(
                "{}/api/devices/v1/deployments/device/deployments/next",
                proxy.url()
            ))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "{}");
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_url_survives_token_rotation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let auth = test_auth(&server, tmp.path()).await;
        let proxy = AuthProxy::spawn(auth.clone()).await.unwrap();
        let url_before = proxy.url().to_string();

        let client = reqwest::Client::new();
        assert_eq!(
            client.get(format!("{url_before}/ping")).send().await.unwrap().status(),
            200
        );

        // Rotate the token; the listener and its port stay put.
        auth.expire_token();
        assert_eq!(proxy.url(), url_before);
        assert_eq!(
            client.get(format!("{url_before}/ping")).send().await.unwrap().status(),
            200
        );
        proxy.shutdown().await;
    }
}
