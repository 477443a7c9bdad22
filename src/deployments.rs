use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use mender_api::deployments::{
    logs_path, status_path, StatusReport, DEPLOYMENTS_NEXT_PATH, LOGS_PREFIX, LOGS_SUFFIX,
};
use mender_api::{Deployment, DeploymentStatus};
use reqwest::StatusCode;

use crate::auth::{authorized_request, Authenticator};
use crate::error::{ClientError, Result};

/// Talks to the deployments service: polls for work, reports progress,
/// ships the deployment log.
pub struct DeploymentClient {
    client: reqwest::Client,
    auth: Authenticator,
}

impl DeploymentClient {
    pub fn new(auth: Authenticator) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth,
        }
    }

    /// Polls for the next deployment. `None` means the server has nothing
    /// for this device.
    pub async fn check(
        &self,
        device_type: &str,
        artifact_name: Option<&str>,
    ) -> Result<Option<Deployment>> {
        let response = authorized_request(&self.auth, |data| {
            let url = format!("{}{}", data.server_url, DEPLOYMENTS_NEXT_PATH);
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(data.token)
                .query(&[("device_type", device_type)]);
            if let Some(name) = artifact_name {
                request = request.query(&[("artifact_name", name)]);
            }
            request.send()
        })
        .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let body = response.text().await?;
                if body.trim().is_empty() {
                    return Ok(None);
                }
                let deployment: Deployment = serde_json::from_str(&body)?;
                info!(
                    "deployment {} offers artifact {}",
                    deployment.id, deployment.artifact.artifact_name
                );
                Ok(Some(deployment))
            }
            status => Err(ClientError::UnexpectedHttpStatus {
                status: status.as_u16(),
                url: DEPLOYMENTS_NEXT_PATH.to_string(),
            }),
        }
    }

    pub async fn push_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        substate: Option<&str>,
    ) -> Result<()> {
        debug!("pushing deployment status {status}");
        let report = StatusReport {
            status: status.as_str().to_string(),
            substate: substate.map(str::to_string),
        };

        let response = authorized_request(&self.auth, |data| {
            let url = format!("{}{}", data.server_url, status_path(deployment_id));
            self.client
                .put(&url)
                .bearer_auth(data.token)
                .json(&report)
                .send()
        })
        .await?;

        if !response.status().is_success() {
            return Err(ClientError::UnexpectedHttpStatus {
                status: response.status().as_u16(),
                url: status_path(deployment_id),
            });
        }
        Ok(())
    }

    /// Uploads the deployment log as one JSON object: the raw log bytes
    /// wrapped in a fixed prefix and suffix.
    pub async fn push_logs(&self, deployment_id: &str, log_file: &Path) -> Result<()> {
        let raw = tokio::fs::read(log_file).await?;
        let body = wrap_log_bundle(&raw);

        let response = authorized_request(&self.auth, |data| {
            let url = format!("{}{}", data.server_url, logs_path(deployment_id));
            self.client
                .put(&url)
                .bearer_auth(data.token)
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
        })
        .await?;

        if !response.status().is_success() {
            return Err(ClientError::UnexpectedHttpStatus {
                status: response.status().as_u16(),
                url: logs_path(deployment_id),
            });
        }
        Ok(())
    }
}

/// The bundle is `prefix + raw + suffix`, so its length is exactly the raw
/// size plus the two fixed parts.
pub fn wrap_log_bundle(raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(LOGS_PREFIX.len() + raw.len() + LOGS_SUFFIX.len());
    body.extend_from_slice(LOGS_PREFIX);
    body.extend_from_slice(raw);
    body.extend_from_slice(LOGS_SUFFIX);
    body
}

/// Per-deployment log file. Records are JSON objects separated by commas so
/// the upload wrapper turns the whole file into a valid JSON array.
pub struct DeploymentLog {
    path: PathBuf,
    empty: bool,
}

impl DeploymentLog {
    pub fn create(dir: &Path, deployment_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("deployments.{deployment_id}.log"));
        std::fs::write(&path, b"")?;
        Ok(Self { path, empty: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, level: &str, message: &str) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let record = serde_json::json!({
            "timestamp": timestamp,
            "level": level,
            "message": message,
        });

        let mut entry = Vec::new();
        if !self.empty {
            entry.push(b',');
        }
        entry.extend_from_slice(record.to_string().as_bytes());

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&entry)?;
        self.empty = false;
        Ok(())
    }
}
