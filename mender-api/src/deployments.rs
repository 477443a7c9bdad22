use serde::{Deserialize, Serialize};

/// Deployment poll endpoint, relative to a server URL.
pub const DEPLOYMENTS_NEXT_PATH: &str = "/api/devices/v1/deployments/device/deployments/next";

pub fn status_path(deployment_id: &str) -> String {
    format!("/api/devices/v1/deployments/device/deployments/{deployment_id}/status")
}

pub fn logs_path(deployment_id: &str) -> String {
    format!("/api/devices/v1/deployments/device/deployments/{deployment_id}/log")
}

/// Status codes pushed to the server while a deployment progresses, in the
/// order the update lifecycle reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Downloading,
    PauseBeforeInstalling,
    Installing,
    PauseBeforeRebooting,
    Rebooting,
    PauseBeforeCommitting,
    Success,
    Failure,
    AlreadyInstalled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Downloading => "downloading",
            DeploymentStatus::PauseBeforeInstalling => "pause_before_installing",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::PauseBeforeRebooting => "pause_before_rebooting",
            DeploymentStatus::Rebooting => "rebooting",
            DeploymentStatus::PauseBeforeCommitting => "pause_before_committing",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failure => "failure",
            DeploymentStatus::AlreadyInstalled => "already-installed",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substate: Option<String>,
}

/// One deployment instruction from `deployments/next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub artifact: DeploymentArtifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentArtifact {
    pub artifact_name: String,
    pub source: ArtifactSource,
    #[serde(default)]
    pub device_types_compatible: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<String>,
}

/// Fixed wrapper around raw deployment log bytes so they upload as one JSON
/// object. The log file itself holds comma-separated JSON records.
pub const LOGS_PREFIX: &[u8] = b"{\"messages\":[";
pub const LOGS_SUFFIX: &[u8] = b"]}";

pub fn logs_content_length(raw_size: u64) -> u64 {
    raw_size + LOGS_PREFIX.len() as u64 + LOGS_SUFFIX.len() as u64
}
