use crate::auth::Authenticator;
use crate::config::MenderConfig;
use crate::deployments::{DeploymentClient, DeploymentLog};
use crate::error::Result;
use crate::installer;
use crate::scripts::ScriptRunner;
use crate::store::{MenderStore, StateData};
use crate::update_module::{RebootAction, UpdateModule};

/// Immutable collaborators of the state machine plus the one mutable slot:
/// the deployment currently being worked on.
pub struct Context {
    pub config: MenderConfig,
    pub store: MenderStore,
    pub auth: Authenticator,
    pub deployments: DeploymentClient,
    pub scripts: ScriptRunner,
    pub device_type: String,
    pub deployment: Option<DeploymentData>,
}

/// Mutable bookkeeping of one deployment, owned by the state machine runner.
/// `state_data` mirrors what is (or will be) persisted; the rest only has to
/// survive for the lifetime of this process.
pub struct DeploymentData {
    /// Deployment id assigned by the server. Absent when an interrupted
    /// deployment was resumed from the persisted record, which does not
    /// carry the id; status reporting is skipped in that case.
    pub id: Option<String>,
    pub state_data: StateData,
    pub artifact_uri: Option<String>,
    pub needs_reboot: RebootAction,
    pub log: Option<DeploymentLog>,
}

impl DeploymentData {
    pub fn resumed(state_data: StateData) -> Self {
        Self {
            id: None,
            state_data,
            artifact_uri: None,
            needs_reboot: RebootAction::No,
            log: None,
        }
    }
}

impl Context {
    pub fn new(config: MenderConfig) -> Result<Self> {
        let store = MenderStore::open(&config.paths.datastore_dir)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: MenderConfig, store: MenderStore) -> Result<Self> {
        let auth = Authenticator::new(&config)?;
        let deployments = DeploymentClient::new(auth.clone());
        let scripts = ScriptRunner::new(&config);
        let device_type = config.device_type()?;

        Ok(Self {
            config,
            store,
            auth,
            deployments,
            scripts,
            device_type,
            deployment: None,
        })
    }

    /// One update module per payload of the current deployment, in payload
    /// order.
    pub fn modules(&self) -> Vec<UpdateModule> {
        let Some(deployment) = &self.deployment else {
            return Vec::new();
        };
        installer::modules_for(&self.config, &deployment.state_data.payload_types)
    }

    /// Path the artifact is downloaded to before parsing.
    pub fn artifact_download_path(&self) -> std::path::PathBuf {
        self.config.paths.datastore_dir.join("update.mender")
    }

    /// Appends to the deployment log, creating it on first use. Only
    /// deployments with a server-assigned id keep a log; it is what gets
    /// uploaded on failure.
    pub fn log_deployment(&mut self, level: &str, message: &str) {
        let Some(deployment) = &mut self.deployment else {
            return;
        };
        let Some(id) = deployment.id.clone() else {
            return;
        };

        if deployment.log.is_none() {
            match DeploymentLog::create(&self.config.paths.datastore_dir, &id) {
                Ok(log) => deployment.log = Some(log),
                Err(err) => {
                    log::error!("failed to create deployment log: {err}");
                    return;
                }
            }
        }
        if let Some(log) = &mut deployment.log {
            if let Err(err) = log.log(level, message) {
                log::error!("failed to write deployment log: {err}");
            }
        }
    }
}
