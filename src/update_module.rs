use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{info, warn};
use mender_artifact::Artifact;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::MenderConfig;
use crate::error::{ClientError, Result};

const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// States of the update module protocol, passed as the first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Download,
    ArtifactInstall,
    NeedsReboot,
    ArtifactReboot,
    ArtifactCommit,
    SupportsRollback,
    ArtifactRollback,
    ArtifactVerifyReboot,
    ArtifactRollbackReboot,
    ArtifactVerifyRollbackReboot,
    ArtifactFailure,
    Cleanup,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Download => "Download",
            ModuleState::ArtifactInstall => "ArtifactInstall",
            ModuleState::NeedsReboot => "NeedsReboot",
            ModuleState::ArtifactReboot => "ArtifactReboot",
            ModuleState::ArtifactCommit => "ArtifactCommit",
            ModuleState::SupportsRollback => "SupportsRollback",
            ModuleState::ArtifactRollback => "ArtifactRollback",
            ModuleState::ArtifactVerifyReboot => "ArtifactVerifyReboot",
            ModuleState::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            ModuleState::ArtifactVerifyRollbackReboot => "ArtifactVerifyRollbackReboot",
            ModuleState::ArtifactFailure => "ArtifactFailure",
            ModuleState::Cleanup => "Cleanup",
        }
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    No,
    Automatic,
    Yes,
}

/// One external installer executable bound to one payload work directory.
pub struct UpdateModule {
    module_path: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
}

struct CapturedOutput {
    first_line: Option<String>,
    too_many_lines: bool,
}

async fn capture_stdout(stdout: ChildStdout, capture: bool) -> CapturedOutput {
    let mut lines = BufReader::new(stdout).lines();
    let mut captured = CapturedOutput {
        first_line: None,
        too_many_lines: false,
    };

    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        if !capture {
            info!("Update Module output: {line}");
            continue;
        }
        if captured.first_line.is_none() {
            captured.first_line = Some(line);
        } else {
            // No state that queries output accepts more than one line.
            // Remember the violation but keep draining so the child never
            // blocks on a full pipe.
            captured.too_many_lines = true;
        }
    }
    captured
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("Update Module output (stderr): {line}");
    }
}

pub(crate) async fn terminate_then_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: sending a signal to the child process id we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("update module ignored SIGTERM, killing it");
    }
    let _ = child.kill().await;
}

impl UpdateModule {
    pub fn new(config: &MenderConfig, payload_type: &str, work_dir: PathBuf) -> Self {
        Self {
            module_path: config.paths.modules_dir.join(payload_type),
            work_dir,
            timeout: config.module_timeout,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Materializes the work directory for a payload: `{header, files, tmp}`
    /// plus the header JSON files the module reads.
    pub fn prepare_work_dir(&self, artifact: &Artifact, payload_index: usize) -> Result<()> {
        let sub_header = artifact.sub_header(payload_index)?;

        for dir in ["header", "files", "tmp"] {
            std::fs::create_dir_all(self.work_dir.join(dir))?;
        }

        let header_dir = self.work_dir.join("header");
        std::fs::write(
            header_dir.join("header-info"),
            serde_json::to_vec_pretty(&artifact.header.info)?,
        )?;
        std::fs::write(
            header_dir.join("type-info"),
            serde_json::to_vec_pretty(&sub_header.type_info)?,
        )?;
        if let Some(meta_data) = &sub_header.meta_data {
            std::fs::write(header_dir.join("meta-data"), serde_json::to_vec_pretty(meta_data)?)?;
        }

        Ok(())
    }

    pub fn files_dir(&self) -> PathBuf {
        self.work_dir.join("files")
    }

    async fn call_state(&self, state: ModuleState, capture: bool) -> Result<Option<String>> {
        let state_name = state.as_str();

        if !self.work_dir.is_dir() {
            if state == ModuleState::Cleanup {
                return Ok(None);
            }
            return Err(ClientError::Process(format!(
                "{state_name}: File tree does not exist: {}",
                self.work_dir.display()
            )));
        }

        let mut child = Command::new(&self.module_path)
            .arg(state_name)
            .arg(&self.work_dir)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                ClientError::Process(format!(
                    "{state_name}: failed to spawn update module {}: {err}",
                    self.module_path.display()
                ))
            })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(capture_stdout(stdout, capture)));
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(log_stderr(stderr)));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|err| {
                ClientError::Process(format!("{state_name}: failed to wait for update module: {err}"))
            })?,
            Err(_) => {
                terminate_then_kill(&mut child).await;
                return Err(ClientError::Timeout(format!(
                    "{state_name}: Timed out while waiting for Update Module to complete"
                )));
            }
        };

        let output = match stdout_task {
            Some(task) => task.await.unwrap_or(CapturedOutput {
                first_line: None,
                too_many_lines: false,
            }),
            None => CapturedOutput {
                first_line: None,
                too_many_lines: false,
            },
        };
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if state == ModuleState::Cleanup {
            match std::fs::remove_dir_all(&self.work_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(ClientError::Process(format!(
                        "{state_name}: Error removing directory {}: {err}",
                        self.work_dir.display()
                    )));
                }
            }
        }

        if !status.success() {
            return Err(ClientError::Process(format!(
                "{state_name}: Update Module returned exit status {}",
                status.code().unwrap_or(-1)
            )));
        }

        if output.too_many_lines {
            return Err(ClientError::Protocol(format!(
                "Too many lines when querying {state_name}"
            )));
        }

        Ok(output.first_line)
    }

    pub async fn download(&self) -> Result<()> {
        self.call_state(ModuleState::Download, false).await.map(|_| ())
    }

    pub async fn artifact_install(&self) -> Result<()> {
        self.call_state(ModuleState::ArtifactInstall, false).await.map(|_| ())
    }

    pub async fn needs_reboot(&self) -> Result<RebootAction> {
        match self
            .call_state(ModuleState::NeedsReboot, true)
            .await?
            .as_deref()
        {
            None | Some("No") => Ok(RebootAction::No),
            Some("Automatic") => Ok(RebootAction::Automatic),
            Some("Yes") => Ok(RebootAction::Yes),
            Some(other) => Err(ClientError::Protocol(format!(
                "Unexpected output from NeedsReboot query: {other}"
            ))),
        }
    }

    pub async fn artifact_reboot(&self) -> Result<()> {
        self.call_state(ModuleState::ArtifactReboot, false).await.map(|_| ())
    }

    pub async fn artifact_verify_reboot(&self) -> Result<()> {
        self.call_state(ModuleState::ArtifactVerifyReboot, false).await.map(|_| ())
    }

    pub async fn artifact_commit(&self) -> Result<()> {
        self.call_state(ModuleState::ArtifactCommit, false).await.map(|_| ())
    }

    pub async fn supports_rollback(&self) -> Result<bool> {
        match self
            .call_state(ModuleState::SupportsRollback, true)
            .await?
            .as_deref()
        {
            None | Some("No") => Ok(false),
            Some("Yes") => Ok(true),
            Some(other) => Err(ClientError::Protocol(format!(
                "Unexpected output from SupportsRollback query: {other}"
            ))),
        }
    }

    pub async fn artifact_rollback(&self) -> Result<()> {
        self.call_state(ModuleState::ArtifactRollback, false).await.map(|_| ())
    }

    pub async fn artifact_rollback_reboot(&self) -> Result<()> {
        self.call_state(ModuleState::ArtifactRollbackReboot, false).await.map(|_| ())
    }

    pub async fn artifact_verify_rollback_reboot(&self) -> Result<()> {
        self.call_state(ModuleState::ArtifactVerifyRollbackReboot, false)
            .await
            .map(|_| ())
    }

    pub async fn artifact_failure(&self) -> Result<()> {
        self.call_state(ModuleState::ArtifactFailure, false).await.map(|_| ())
    }

    /// No-op when the work directory is already gone; removes the tree after
    /// the module returned successfully.
    pub async fn cleanup(&self) -> Result<()> {
        self.call_state(ModuleState::Cleanup, false).await.map(|_| ())
    }
}

/// Lists the installer executables available on this device.
pub fn discover_update_modules(config: &MenderConfig) -> Result<Vec<String>> {
    let dir = &config.paths.modules_dir;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("update modules directory {} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    let mut modules = Vec::new();
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                continue;
            }
        }
        modules.push(entry.file_name().to_string_lossy().into_owned());
    }
    modules.sort();
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn test_config(root: &Path) -> MenderConfig {
        let paths = crate::config::Paths::from_dirs(
            root.join("etc"),
            root.join("share"),
            root.join("datastore"),
        );
        let mut config = MenderConfig::load_from(paths).unwrap();
        config.module_timeout = Duration::from_secs(5);
        config
    }

    fn install_module(config: &MenderConfig, name: &str, body: &str) {
        std::fs::create_dir_all(&config.paths.modules_dir).unwrap();
        let path = config.paths.modules_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn work_dir(root: &Path) -> PathBuf {
        let dir = root.join("work");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_state_name_and_work_dir_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(&config, "dummy", r#"echo "$1 $2" > "$2/invoked""#);

        let module = UpdateModule::new(&config, "dummy", work_dir(tmp.path()));
        module.artifact_install().await.unwrap();

        let invoked = std::fs::read_to_string(module.work_dir().join("invoked")).unwrap();
        let expected = format!("ArtifactInstall {}\n", module.work_dir().display());
        assert_eq!(invoked, expected);
    }

    #[tokio::test]
    async fn test_needs_reboot_query() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(
            &config,
            "dummy",
            r#"if [ "$1" = "NeedsReboot" ]; then echo "Automatic"; fi"#,
        );

        let module = UpdateModule::new(&config, "dummy", work_dir(tmp.path()));
        assert_eq!(module.needs_reboot().await.unwrap(), RebootAction::Automatic);
    }

    #[tokio::test]
    async fn test_query_without_output_defaults_to_no() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(&config, "dummy", "true");

        let module = UpdateModule::new(&config, "dummy", work_dir(tmp.path()));
        assert_eq!(module.needs_reboot().await.unwrap(), RebootAction::No);
        assert!(!module.supports_rollback().await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_query_output_is_protocol_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(&config, "dummy", r#"echo "Maybe""#);

        let module = UpdateModule::new(&config, "dummy", work_dir(tmp.path()));
        let err = module.supports_rollback().await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_multi_line_query_output_is_protocol_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(&config, "dummy", "echo Yes\necho No");

        let module = UpdateModule::new(&config, "dummy", work_dir(tmp.path()));
        let err = module.supports_rollback().await.unwrap_err();
        assert!(err.to_string().contains("Too many lines when querying SupportsRollback"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(&config, "dummy", "exit 3");

        let module = UpdateModule::new(&config, "dummy", work_dir(tmp.path()));
        let err = module.artifact_install().await.unwrap_err();
        assert!(err.to_string().contains("exit status 3"));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_module() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.module_timeout = Duration::from_millis(200);
        install_module(&config, "dummy", "sleep 30");

        let module = UpdateModule::new(&config, "dummy", work_dir(tmp.path()));
        let err = module.artifact_install().await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(err.to_string().contains("Timed out while waiting for Update Module"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_work_dir_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(&config, "dummy", "true");

        let module = UpdateModule::new(&config, "dummy", work_dir(tmp.path()));
        assert!(module.work_dir().exists());

        module.cleanup().await.unwrap();
        assert!(!module.work_dir().exists());

        // Second call is a no-op on the missing directory.
        module.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_work_dir_is_an_error_except_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(&config, "dummy", "true");

        let module = UpdateModule::new(&config, "dummy", tmp.path().join("gone"));
        let err = module.artifact_install().await.unwrap_err();
        assert!(err.to_string().contains("File tree does not exist"));
    }

    #[tokio::test]
    async fn test_discover_update_modules() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        install_module(&config, "rootfs-image", "true");
        install_module(&config, "docker", "true");
        // Not executable, must be skipped.
        std::fs::write(config.paths.modules_dir.join("README"), "docs").unwrap();

        let modules = discover_update_modules(&config).unwrap();
        assert_eq!(modules, vec!["docker".to_string(), "rootfs-image".to_string()]);
    }

    #[tokio::test]
    async fn test_discover_without_modules_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        assert!(discover_update_modules(&config).unwrap().is_empty());
    }
}
