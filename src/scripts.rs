use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use mender_artifact::ArtifactScript;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::MenderConfig;
use crate::error::{ClientError, Result};

/// Exit code with which a lifecycle script asks to be re-run later.
pub const RETRY_LATER_EXIT_CODE: i32 = 21;

/// Version of the state script interface; a `version` file in the scripts
/// directory must match when present.
const SCRIPTS_VERSION: &str = "3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Sync,
    Download,
    ArtifactInstall,
    ArtifactReboot,
    ArtifactCommit,
    ArtifactRollback,
    ArtifactRollbackReboot,
    ArtifactFailure,
}

impl ScriptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptState::Sync => "Sync",
            ScriptState::Download => "Download",
            ScriptState::ArtifactInstall => "ArtifactInstall",
            ScriptState::ArtifactReboot => "ArtifactReboot",
            ScriptState::ArtifactCommit => "ArtifactCommit",
            ScriptState::ArtifactRollback => "ArtifactRollback",
            ScriptState::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            ScriptState::ArtifactFailure => "ArtifactFailure",
        }
    }

    /// Artifact states ship with the artifact and live in the datastore;
    /// the rest are installed with the device image.
    fn is_artifact_state(&self) -> bool {
        !matches!(self, ScriptState::Sync | ScriptState::Download)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    Enter,
    Leave,
    Error,
}

impl ScriptAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptAction::Enter => "Enter",
            ScriptAction::Leave => "Leave",
            ScriptAction::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Fail,
    /// Collect failures without propagating; used for Error actions only.
    Ignore,
}

fn matches_script_name(name: &str, state: ScriptState, action: ScriptAction) -> bool {
    let prefix = format!("{}_{}_", state.as_str(), action.as_str());
    let Some(rest) = name.strip_prefix(&prefix) else {
        return false;
    };
    let mut chars = rest.chars();
    let (Some(a), Some(b)) = (chars.next(), chars.next()) else {
        return false;
    };
    if !a.is_ascii_digit() || !b.is_ascii_digit() {
        return false;
    }
    match chars.next() {
        None => true,
        Some('_') => chars.next().is_some(),
        Some(_) => false,
    }
}

/// Runs ordered lifecycle scripts for a `(state, action)` pair with the
/// configured retry, timeout and error policies.
pub struct ScriptRunner {
    script_timeout: Duration,
    retry_interval: Duration,
    retry_timeout: Duration,
    artifact_scripts_dir: PathBuf,
    rootfs_scripts_dir: PathBuf,
}

impl ScriptRunner {
    pub fn new(config: &MenderConfig) -> Self {
        Self {
            script_timeout: config.script_timeout,
            retry_interval: config.script_retry_interval,
            retry_timeout: config.script_retry_timeout,
            artifact_scripts_dir: config.paths.artifact_scripts_dir.clone(),
            rootfs_scripts_dir: config.paths.rootfs_scripts_dir.clone(),
        }
    }

    fn script_dir(&self, state: ScriptState) -> &Path {
        if state.is_artifact_state() {
            &self.artifact_scripts_dir
        } else {
            &self.rootfs_scripts_dir
        }
    }

    fn check_version_file(&self, dir: &Path) -> Result<()> {
        let path = dir.join("version");
        if !path.exists() {
            return Ok(());
        }
        let version = std::fs::read_to_string(&path)?;
        if version.trim() != SCRIPTS_VERSION {
            return Err(ClientError::State(format!(
                "unsupported state script version: {}",
                version.trim()
            )));
        }
        Ok(())
    }

    fn enumerate(&self, state: ScriptState, action: ScriptAction) -> Result<Vec<PathBuf>> {
        let dir = self.script_dir(state);
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        self.check_version_file(dir)?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !matches_script_name(&name, state, action) {
                continue;
            }
            if !entry.metadata()?.is_file() {
                continue;
            }
            names.push(name);
        }
        // The NN prefix makes lexicographic order the execution order.
        names.sort();

        Ok(names.into_iter().map(|name| dir.join(name)).collect())
    }

    async fn execute_once(&self, script: &Path) -> Result<i32> {
        let script_name = script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| script.display().to_string());

        let mut child = Command::new(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ClientError::Script {
                script: script_name.clone(),
                reason: format!("failed to spawn: {err}"),
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("Collected output (stdout) while running script: {line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("Collected output (stderr) while running script: {line}");
                }
            });
        }

        let status = match tokio::time::timeout(self.script_timeout, child.wait()).await {
            Ok(status) => status.map_err(|err| ClientError::Script {
                script: script_name.clone(),
                reason: format!("failed to wait: {err}"),
            })?,
            Err(_) => {
                crate::update_module::terminate_then_kill(&mut child).await;
                return Err(ClientError::Timeout(format!(
                    "script {script_name} timed out"
                )));
            }
        };

        Ok(status.code().unwrap_or(-1))
    }

    async fn execute_with_retry(&self, script: &Path) -> Result<()> {
        let script_name = script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| script.display().to_string());
        let started = Instant::now();

        loop {
            let code = self.execute_once(script).await?;
            match code {
                0 => return Ok(()),
                RETRY_LATER_EXIT_CODE => {
                    if started.elapsed() + self.retry_interval > self.retry_timeout {
                        return Err(ClientError::Script {
                            script: script_name,
                            reason: "retry-later budget exhausted".to_string(),
                        });
                    }
                    debug!("script {script_name} asked to be retried, waiting {:?}", self.retry_interval);
                    tokio::time::sleep(self.retry_interval).await;
                }
                code => {
                    return Err(ClientError::Script {
                        script: script_name,
                        reason: format!("exit code {code}"),
                    });
                }
            }
        }
    }

    /// Runs all matching scripts serially in lexicographic order, aborting
    /// on the first unrecovered failure unless `on_error` says to collect.
    pub async fn run_scripts(
        &self,
        state: ScriptState,
        action: ScriptAction,
        on_error: OnError,
    ) -> Result<()> {
        let scripts = self.enumerate(state, action)?;
        debug!(
            "running {} script(s) for {}_{}",
            scripts.len(),
            state.as_str(),
            action.as_str()
        );

        for script in &scripts {
            match self.execute_with_retry(script).await {
                Ok(()) => {}
                Err(err) => match on_error {
                    OnError::Fail => return Err(err),
                    OnError::Ignore => {
                        error!("ignoring failed state script: {err}");
                    }
                },
            }
        }
        Ok(())
    }
}

/// Unpacks the scripts shipped in an artifact header into the artifact
/// scripts directory, replacing whatever the previous deployment left.
pub fn install_artifact_scripts(scripts: &[ArtifactScript], dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;

    for script in scripts {
        let path = dir.join(&script.name);
        std::fs::write(&path, &script.content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
    }
    std::fs::write(dir.join("version"), SCRIPTS_VERSION)?;
    Ok(())
}
