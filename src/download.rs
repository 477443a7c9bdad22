use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};

use crate::error::{ClientError, Result};
use crate::util::ExponentialBackoff;

const MAX_DOWNLOAD_ATTEMPTS: u32 = 8;
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub struct DownloadResult {
    /// Lowercase hex SHA-256 of the downloaded bytes.
    pub shasum: String,
    pub size: u64,
}

async fn do_download_and_hash(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    token: Option<&str>,
) -> Result<DownloadResult> {
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let mut res = request.send().await?;

    // Redirect was already handled at this point, so there is no need to
    // touch response or url again. Simply print info and continue.
    if res.url().as_str() != url {
        info!("redirected to URL {:?}", res.url());
    }

    // Return immediately on download failure on the client side.
    let status = res.status();
    if !status.is_success() {
        if matches!(status, StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) {
            debug!("cannot fetch remotely with status code {status:?}");
        }
        return Err(ClientError::UnexpectedHttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let mut file = File::create(path)?;
    let mut hasher = Sha256::new();

    let mut bytes_read = 0u64;
    let bytes_to_read = res.content_length().unwrap_or(u64::MAX);

    while let Some(chunk) = res.chunk().await? {
        bytes_read += chunk.len() as u64;

        hasher.update(&chunk);
        file.write_all(&chunk)?;

        debug!("read {}/{} bytes", bytes_read, bytes_to_read);
    }

    file.flush()?;

    Ok(DownloadResult {
        shasum: hex::encode(hasher.finalize()),
        size: bytes_read,
    })
}

fn is_retriable(err: &ClientError) -> bool {
    match err {
        ClientError::Transport(_) => true,
        // Server side trouble may clear up; client side rejections will not.
        ClientError::UnexpectedHttpStatus { status, .. } => *status >= 500,
        _ => false,
    }
}

/// Streams `url` into `path` with incremental hashing, retrying transport
/// failures with exponential backoff within a bounded budget.
pub async fn download_and_hash(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    token: Option<&str>,
    retry_interval: Duration,
) -> Result<DownloadResult> {
    let mut backoff = ExponentialBackoff::new(retry_interval, MAX_RETRY_INTERVAL, MAX_DOWNLOAD_ATTEMPTS);

    loop {
        match do_download_and_hash(client, url, path, token).await {
            Ok(result) => return Ok(result),
            Err(err) if is_retriable(&err) => match backoff.next() {
                Some(interval) => {
                    info!("downloading failed with error {err}, retrying in {interval:?}");
                    tokio::time::sleep(interval).await;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_download_and_hash() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/artifact"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"foobarbaz".to_vec()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("artifact.mender");
        let client = reqwest::Client::new();

        let result = download_and_hash(
            &client,
            &format!("{}/artifact", server.uri()),
            &path,
            None,
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert_eq!(result.size, 9);
        assert_eq!(
            result.shasum,
            "97df3588b5a3f24babc3851b372f0ba71a9dcdded43b14b9d06961bfc1707d9d"
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"foobarbaz");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/artifact"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let err = download_and_hash(
            &client,
            &format!("{}/artifact", server.uri()),
            &tmp.path().join("out"),
            None,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ClientError::UnexpectedHttpStatus { status: 404, .. }
        ));
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/artifact"))
            .and(wiremock::matchers::header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        download_and_hash(
            &client,
            &format!("{}/artifact", server.uri()),
            &tmp.path().join("out"),
            Some("secret"),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
    }
}
