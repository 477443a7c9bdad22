use std::collections::BTreeMap;

use log::{error, info, warn};

use crate::config::MenderConfig;
use crate::error::{ClientError, Result};
use crate::installer;
use crate::scripts::{OnError, ScriptAction, ScriptRunner, ScriptState};
use crate::store::{MenderStore, STANDALONE_STATE_KEY};
use crate::update_module::RebootAction;

/// Result of a standalone `install`: whether the device has to reboot, and
/// whether the update was committed right away or awaits an explicit
/// `commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub artifact_name: String,
    pub needs_reboot: bool,
    pub committed: bool,
}

const IN_STATE_INSTALLED: &str = "standalone-installed";

async fn fetch_to_file(config: &MenderConfig, src: &str) -> Result<std::path::PathBuf> {
    let is_url = matches!(
        url::Url::parse(src),
        Ok(url) if matches!(url.scheme(), "http" | "https")
    );
    if is_url {
        let path = config.paths.datastore_dir.join("update.mender");
        let client = reqwest::Client::new();
        let result = crate::download::download_and_hash(
            &client,
            src,
            &path,
            None,
            config.retry_poll_interval,
        )
        .await?;
        info!("downloaded {} bytes, sha256 {}", result.size, result.shasum);
        Ok(path)
    } else {
        Ok(std::path::PathBuf::from(src))
    }
}

/// Installs an artifact from a local path or URL, without a deployment from
/// the server. The update is committed immediately unless the module asks
/// for a reboot or supports rollback; those wait for an explicit `commit`
/// (or `rollback`).
pub async fn install(config: &MenderConfig, store: &MenderStore, src: &str) -> Result<InstallOutcome> {
    if store.load_state_data(STANDALONE_STATE_KEY)?.is_some() {
        return Err(ClientError::State(
            "a standalone update is already in progress, commit or roll it back first".to_string(),
        ));
    }

    let artifact_path = fetch_to_file(config, src).await?;
    let scripts = ScriptRunner::new(config);

    scripts
        .run_scripts(ScriptState::Download, ScriptAction::Enter, OnError::Fail)
        .await?;

    let staged = {
        let config = config.clone();
        let parser_config = config.parser_config()?;
        let device_type = config.device_type()?;
        let provides = store.full_provides()?;
        let artifact_path = artifact_path.clone();
        tokio::task::spawn_blocking(move || {
            installer::stage_artifact(&config, &parser_config, &artifact_path, &device_type, &provides)
        })
        .await
        .map_err(|err| ClientError::Process(format!("staging task failed: {err}")))??
    };

    if let Some(reason) = staged.incompatible {
        let _ = scripts
            .run_scripts(ScriptState::Download, ScriptAction::Error, OnError::Ignore)
            .await;
        return Err(ClientError::State(format!(
            "artifact is not compatible with this device: {reason}"
        )));
    }

    let mut state_data = installer::state_data_from_artifact(&staged.artifact, IN_STATE_INSTALLED);
    let modules = installer::modules_for(config, &state_data.payload_types);

    let install_result: Result<(RebootAction, bool)> = async {
        for module in &modules {
            module.download().await?;
        }
        scripts
            .run_scripts(ScriptState::Download, ScriptAction::Leave, OnError::Fail)
            .await?;

        scripts
            .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Enter, OnError::Fail)
            .await?;
        for module in &modules {
            module.artifact_install().await?;
        }
        scripts
            .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Leave, OnError::Fail)
            .await?;

        let mut needs_reboot = RebootAction::No;
        let mut supports_rollback = false;
        for module in &modules {
            match module.needs_reboot().await? {
                RebootAction::No => {}
                action => needs_reboot = action,
            }
            if module.supports_rollback().await? {
                supports_rollback = true;
            }
        }
        Ok((needs_reboot, supports_rollback))
    }
    .await;

    let (needs_reboot, supports_rollback) = match install_result {
        Ok(result) => result,
        Err(err) => {
            error!("standalone install failed: {err}");
            let _ = scripts
                .run_scripts(ScriptState::ArtifactInstall, ScriptAction::Error, OnError::Ignore)
                .await;
            // Unwind what we can before surfacing the error.
            for module in &modules {
                if let Err(failure_err) = module.artifact_failure().await {
                    warn!("ArtifactFailure call failed: {failure_err}");
                }
                if let Err(cleanup_err) = module.cleanup().await {
                    warn!("Cleanup call failed: {cleanup_err}");
                }
            }
            return Err(err);
        }
    };

    state_data.in_state = IN_STATE_INSTALLED.to_string();
    store.save_state_data(STANDALONE_STATE_KEY, &state_data)?;

    let outcome = InstallOutcome {
        artifact_name: state_data.artifact_name.clone(),
        needs_reboot: needs_reboot != RebootAction::No,
        committed: false,
    };

    if outcome.needs_reboot || supports_rollback {
        info!(
            "artifact {} installed, commit it once verified",
            outcome.artifact_name
        );
        return Ok(outcome);
    }

    // Nothing to wait for, finish the lifecycle now.
    commit(config, store).await?;
    Ok(InstallOutcome {
        committed: true,
        ..outcome
    })
}

/// Commits a pending standalone update.
pub async fn commit(config: &MenderConfig, store: &MenderStore) -> Result<()> {
    let mut state_data = store
        .load_state_data(STANDALONE_STATE_KEY)?
        .ok_or_else(|| ClientError::State("no standalone update in progress".to_string()))?;

    let scripts = ScriptRunner::new(config);
    let modules = installer::modules_for(config, &state_data.payload_types);

    let result: Result<()> = async {
        scripts
            .run_scripts(ScriptState::ArtifactCommit, ScriptAction::Enter, OnError::Fail)
            .await?;
        for module in &modules {
            module.artifact_commit().await?;
        }
        scripts
            .run_scripts(ScriptState::ArtifactCommit, ScriptAction::Leave, OnError::Fail)
            .await?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        error!("commit failed: {err}");
        let _ = scripts
            .run_scripts(ScriptState::ArtifactCommit, ScriptAction::Error, OnError::Ignore)
            .await;
        return Err(err);
    }

    state_data.in_state = "standalone-committed".to_string();
    store.commit_artifact_data(STANDALONE_STATE_KEY, &state_data)?;

    for module in &modules {
        if let Err(err) = module.cleanup().await {
            warn!("Cleanup call failed: {err}");
        }
    }
    store.clear_deployment_data(STANDALONE_STATE_KEY)?;

    info!("artifact {} committed", state_data.artifact_name);
    Ok(())
}

/// Rolls a pending standalone update back.
pub async fn rollback(config: &MenderConfig, store: &MenderStore) -> Result<()> {
    let state_data = store
        .load_state_data(STANDALONE_STATE_KEY)?
        .ok_or_else(|| ClientError::State("no standalone update in progress".to_string()))?;

    let scripts = ScriptRunner::new(config);
    let modules = installer::modules_for(config, &state_data.payload_types);

    for module in &modules {
        if !module.supports_rollback().await? {
            return Err(ClientError::State(
                "the installed update module does not support rollback".to_string(),
            ));
        }
    }

    let result: Result<()> = async {
        scripts
            .run_scripts(ScriptState::ArtifactRollback, ScriptAction::Enter, OnError::Fail)
            .await?;
        for module in &modules {
            module.artifact_rollback().await?;
        }
        scripts
            .run_scripts(ScriptState::ArtifactRollback, ScriptAction::Leave, OnError::Fail)
            .await?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        error!("rollback failed: {err}");
        let _ = scripts
            .run_scripts(ScriptState::ArtifactRollback, ScriptAction::Error, OnError::Ignore)
            .await;
        return Err(err);
    }

    for module in &modules {
        let _ = scripts
            .run_scripts(ScriptState::ArtifactFailure, ScriptAction::Enter, OnError::Ignore)
            .await;
        if let Err(err) = module.artifact_failure().await {
            warn!("ArtifactFailure call failed: {err}");
        }
        let _ = scripts
            .run_scripts(ScriptState::ArtifactFailure, ScriptAction::Leave, OnError::Ignore)
            .await;
        if let Err(err) = module.cleanup().await {
            warn!("Cleanup call failed: {err}");
        }
    }
    store.clear_deployment_data(STANDALONE_STATE_KEY)?;

    info!("artifact {} rolled back", state_data.artifact_name);
    Ok(())
}

/// Provides/depends snapshot printed by the CLI.
pub fn show_provides(store: &MenderStore) -> Result<BTreeMap<String, String>> {
    Ok(store.full_provides()?)
}
