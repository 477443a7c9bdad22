use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use mender_artifact::rsa;
use serde::Deserialize;

use crate::error::{ClientError, Result};

const DEFAULT_CONF_DIR: &str = "/etc/mender";
const DEFAULT_DATA_DIR: &str = "/usr/share/mender";
const DEFAULT_DATASTORE_DIR: &str = "/var/lib/mender";

const DEFAULT_KEY_FILE: &str = "mender-agent.pem";
const CONF_FILE: &str = "mender.conf";
const DEVICE_TYPE_FILE: &str = "device_type";

const DEFAULT_UPDATE_POLL_INTERVAL: u64 = 1800;
const DEFAULT_INVENTORY_POLL_INTERVAL: u64 = 28800;
const DEFAULT_RETRY_POLL_INTERVAL: u64 = 300;
const DEFAULT_MODULE_TIMEOUT: u64 = 4 * 3600;
const DEFAULT_SCRIPT_TIMEOUT: u64 = 3600;
const DEFAULT_SCRIPT_RETRY_INTERVAL: u64 = 60;
const DEFAULT_SCRIPT_RETRY_TIMEOUT: u64 = 1800;
const DEFAULT_AUTH_TIMEOUT: u64 = 60;

fn env_or(var: &str, fallback: &str) -> PathBuf {
    match env::var(var) {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(fallback),
    }
}

/// Device specific paths, derived from the three directory roots. The roots
/// honor `MENDER_CONF_DIR`, `MENDER_DATA_DIR` and `MENDER_DATASTORE_DIR`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub conf_dir: PathBuf,
    pub data_dir: PathBuf,
    pub datastore_dir: PathBuf,

    pub key_file: PathBuf,
    pub device_type_file: PathBuf,
    pub modules_dir: PathBuf,
    pub modules_work_dir: PathBuf,
    pub artifact_scripts_dir: PathBuf,
    pub rootfs_scripts_dir: PathBuf,
    pub inventory_scripts_dir: PathBuf,
}

impl Paths {
    pub fn from_env() -> Self {
        let conf_dir = env_or("MENDER_CONF_DIR", DEFAULT_CONF_DIR);
        let data_dir = env_or("MENDER_DATA_DIR", DEFAULT_DATA_DIR);
        let datastore_dir = env_or("MENDER_DATASTORE_DIR", DEFAULT_DATASTORE_DIR);
        Self::from_dirs(conf_dir, data_dir, datastore_dir)
    }

    pub fn from_dirs(conf_dir: PathBuf, data_dir: PathBuf, datastore_dir: PathBuf) -> Self {
        Self {
            key_file: datastore_dir.join(DEFAULT_KEY_FILE),
            device_type_file: datastore_dir.join(DEVICE_TYPE_FILE),
            modules_dir: data_dir.join("modules/v3"),
            modules_work_dir: datastore_dir.join("modules/v3"),
            artifact_scripts_dir: datastore_dir.join("scripts"),
            rootfs_scripts_dir: conf_dir.join("scripts"),
            inventory_scripts_dir: data_dir.join("inventory"),
            conf_dir,
            data_dir,
            datastore_dir,
        }
    }
}

/// On-disk configuration file shape. All fields are optional; defaults and
/// environment derived paths fill the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ConfigFile {
    servers: Vec<ServerEntry>,
    #[serde(rename = "ServerURL")]
    server_url: Option<String>,
    tenant_token: Option<String>,
    identity_script: Option<PathBuf>,
    artifact_verify_key: Option<PathBuf>,
    artifact_verify_keys: Vec<PathBuf>,
    update_poll_interval_seconds: Option<u64>,
    inventory_poll_interval_seconds: Option<u64>,
    retry_poll_interval_seconds: Option<u64>,
    module_timeout_seconds: Option<u64>,
    state_script_timeout_seconds: Option<u64>,
    state_script_retry_interval_seconds: Option<u64>,
    state_script_retry_timeout_seconds: Option<u64>,
    auth_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerEntry {
    #[serde(rename = "ServerURL")]
    server_url: String,
}

/// Resolved configuration. Built once at startup and passed around by
/// reference; nothing here mutates at runtime.
#[derive(Debug, Clone)]
pub struct MenderConfig {
    pub paths: Paths,

    pub servers: Vec<String>,
    pub tenant_token: String,
    pub identity_script: PathBuf,
    pub artifact_verify_keys: Vec<PathBuf>,

    pub update_poll_interval: Duration,
    pub inventory_poll_interval: Duration,
    pub retry_poll_interval: Duration,
    pub module_timeout: Duration,
    pub script_timeout: Duration,
    pub script_retry_interval: Duration,
    pub script_retry_timeout: Duration,
    pub auth_timeout: Duration,
}

impl MenderConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Paths::from_env())
    }

    pub fn load_from(paths: Paths) -> Result<Self> {
        let conf_path = paths.conf_dir.join(CONF_FILE);
        let fallback_path = paths.datastore_dir.join(CONF_FILE);

        let file = match read_config_file(&conf_path)? {
            Some(file) => Some(file),
            None => read_config_file(&fallback_path)?,
        };
        let file = match file {
            Some(file) => file,
            None => {
                warn!("no configuration file found, using built-in defaults");
                ConfigFile::default()
            }
        };

        let mut servers: Vec<String> = file
            .servers
            .iter()
            .map(|entry| entry.server_url.trim_end_matches('/').to_string())
            .collect();
        if servers.is_empty() {
            if let Some(url) = &file.server_url {
                servers.push(url.trim_end_matches('/').to_string());
            }
        }

        let mut verify_keys = file.artifact_verify_keys.clone();
        if let Some(key) = &file.artifact_verify_key {
            if !verify_keys.contains(key) {
                verify_keys.insert(0, key.clone());
            }
        }

        let seconds = Duration::from_secs;
        let config = Self {
            identity_script: file
                .identity_script
                .unwrap_or_else(|| paths.data_dir.join("identity/mender-device-identity")),
            servers,
            tenant_token: file.tenant_token.unwrap_or_default(),
            artifact_verify_keys: verify_keys,
            update_poll_interval: seconds(
                file.update_poll_interval_seconds
                    .unwrap_or(DEFAULT_UPDATE_POLL_INTERVAL),
            ),
            inventory_poll_interval: seconds(
                file.inventory_poll_interval_seconds
                    .unwrap_or(DEFAULT_INVENTORY_POLL_INTERVAL),
            ),
            retry_poll_interval: seconds(
                file.retry_poll_interval_seconds
                    .unwrap_or(DEFAULT_RETRY_POLL_INTERVAL),
            ),
            module_timeout: seconds(file.module_timeout_seconds.unwrap_or(DEFAULT_MODULE_TIMEOUT)),
            script_timeout: seconds(
                file.state_script_timeout_seconds
                    .unwrap_or(DEFAULT_SCRIPT_TIMEOUT),
            ),
            script_retry_interval: seconds(
                file.state_script_retry_interval_seconds
                    .unwrap_or(DEFAULT_SCRIPT_RETRY_INTERVAL),
            ),
            script_retry_timeout: seconds(
                file.state_script_retry_timeout_seconds
                    .unwrap_or(DEFAULT_SCRIPT_RETRY_TIMEOUT),
            ),
            auth_timeout: seconds(file.auth_timeout_seconds.unwrap_or(DEFAULT_AUTH_TIMEOUT)),
            paths,
        };

        debug!("resolved configuration: {config:?}");
        Ok(config)
    }

    /// The device type, read from the `device_type` file in the datastore
    /// directory (`device_type=<name>`).
    pub fn device_type(&self) -> Result<String> {
        let content = fs::read_to_string(&self.paths.device_type_file)?;
        for line in content.lines() {
            if let Some(value) = line.strip_prefix("device_type=") {
                return Ok(value.trim().to_string());
            }
        }
        Err(ClientError::Config(format!(
            "no device_type entry in {}",
            self.paths.device_type_file.display()
        )))
    }

    /// Artifact verification keys loaded from disk. An empty configured list
    /// means signature verification is skipped.
    pub fn load_verify_keys(&self) -> Result<Vec<rsa::RsaPublicKey>> {
        let mut keys = Vec::new();
        for path in &self.artifact_verify_keys {
            keys.push(mender_artifact::verify_sig::public_key_from_file(path)?);
        }
        Ok(keys)
    }

    pub fn parser_config(&self) -> Result<mender_artifact::ParserConfig> {
        let verify_keys = self.load_verify_keys()?;
        let signature_policy = if verify_keys.is_empty() {
            mender_artifact::SignaturePolicy::Skip
        } else {
            mender_artifact::SignaturePolicy::Verify
        };
        Ok(mender_artifact::ParserConfig {
            signature_policy,
            verify_keys,
        })
    }
}

fn read_config_file(path: &Path) -> Result<Option<ConfigFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let file = serde_json::from_str(&content)
        .map_err(|err| ClientError::Config(format!("{}: {err}", path.display())))?;
    Ok(Some(file))
}
