use crate::store::StoreError;

/// Error taxonomy of the update client. Parse and integrity problems stay in
/// [`mender_artifact::Error`]; everything the client adds on top is here.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Artifact(#[from] mender_artifact::Error),

    #[error(transparent)]
    Crypto(#[from] mender_artifact::verify_sig::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedHttpStatus { status: u16, url: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("request not authorized, even after re-authentication")]
    Unauthorized,

    #[error("update module protocol error: {0}")]
    Protocol(String),

    #[error("invalid state transition: {0}")]
    State(String),

    #[error("state loop detected while entering `{0}`")]
    StateLoop(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Process(String),

    #[error("{0}")]
    Timeout(String),

    #[error("script {script} failed: {reason}")]
    Script { script: String, reason: String },

    #[error("invalid identity data: {0}")]
    Identity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Authentication failures get their own clonable type: one acquisition can
/// complete many queued waiters, each of which receives the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("authentication request rejected by the server: {0}")]
    Authentication(String),

    #[error("no server could be reached for authentication: {0}")]
    Transport(String),

    #[error("timed out waiting for authentication to complete")]
    Timeout,

    #[error("authentication setup failed: {0}")]
    Setup(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
