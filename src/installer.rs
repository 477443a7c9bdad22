use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use mender_artifact::{Artifact, HeaderDecision, InstallHandler, ParserConfig, PayloadFile};

use crate::config::MenderConfig;
use crate::error::Result;
use crate::scripts;
use crate::store::{StateData, STATE_DATA_VERSION};
use crate::update_module::UpdateModule;

/// Work directory of one payload, keyed by its index so an interrupted
/// deployment can find it again from the persisted record alone.
pub fn work_dir_for(config: &MenderConfig, payload_index: usize) -> PathBuf {
    config
        .paths
        .modules_work_dir
        .join(format!("payload-{payload_index:04}"))
}

/// One update module per payload type, bound to the per-index work
/// directories, in payload order.
pub fn modules_for(config: &MenderConfig, payload_types: &[String]) -> Vec<UpdateModule> {
    payload_types
        .iter()
        .enumerate()
        .map(|(index, payload_type)| {
            UpdateModule::new(config, payload_type, work_dir_for(config, index))
        })
        .collect()
}

/// Outcome of parsing and staging an artifact from disk.
pub struct StagedInstall {
    pub artifact: Artifact,
    /// Set when the artifact's depends do not match this device; nothing
    /// was staged in that case.
    pub incompatible: Option<String>,
}

struct StagingHandler {
    config: MenderConfig,
    device_type: String,
    provides: BTreeMap<String, String>,
    incompatible: Option<String>,
    staged_files: usize,
}

fn provides_match(provides: &BTreeMap<String, String>, key: &str, accepted: &serde_json::Value) -> bool {
    let Some(value) = provides.get(key) else {
        return false;
    };
    match accepted {
        serde_json::Value::String(expected) => expected == value,
        serde_json::Value::Array(options) => options
            .iter()
            .any(|option| option.as_str() == Some(value.as_str())),
        _ => false,
    }
}

impl StagingHandler {
    fn unsatisfied_dependency(&self, artifact: &Artifact) -> Option<String> {
        let depends = &artifact.header.info.depends;

        if !depends.device_type.iter().any(|dt| dt == &self.device_type) {
            return Some(format!(
                "artifact depends on device types {:?}, this device is a {}",
                depends.device_type, self.device_type
            ));
        }
        if let Some(names) = &depends.artifact_name {
            match self.provides.get("artifact_name") {
                Some(current) if names.contains(current) => {}
                current => {
                    return Some(format!(
                        "artifact depends on a currently installed artifact in {names:?}, have {current:?}"
                    ));
                }
            }
        }
        if let Some(groups) = &depends.artifact_group {
            match self.provides.get("artifact_group") {
                Some(current) if groups.contains(current) => {}
                current => {
                    return Some(format!(
                        "artifact depends on artifact groups {groups:?}, have {current:?}"
                    ));
                }
            }
        }

        for sub_header in &artifact.header.sub_headers {
            if let Some(depends) = &sub_header.type_info.artifact_depends {
                for (key, accepted) in depends {
                    if !provides_match(&self.provides, key, accepted) {
                        return Some(format!(
                            "payload depends on {key} in {accepted}, device provides {:?}",
                            self.provides.get(key)
                        ));
                    }
                }
            }
        }

        None
    }
}

impl InstallHandler for StagingHandler {
    fn on_header(&mut self, artifact: &Artifact) -> mender_artifact::Result<HeaderDecision> {
        if let Some(reason) = self.unsatisfied_dependency(artifact) {
            info!("not staging artifact: {reason}");
            self.incompatible = Some(reason);
            return Ok(HeaderDecision::Stop);
        }

        scripts::install_artifact_scripts(
            &artifact.header.scripts,
            &self.config.paths.artifact_scripts_dir,
        )
        .map_err(|err| mender_artifact::Error::Io(std::io::Error::other(err.to_string())))?;

        for index in 0..artifact.payload_count() {
            let payload_type = artifact.payload_type(index)?.to_string();
            let module = UpdateModule::new(&self.config, &payload_type, work_dir_for(&self.config, index));
            module
                .prepare_work_dir(artifact, index)
                .map_err(|err| mender_artifact::Error::Io(std::io::Error::other(err.to_string())))?;
        }

        Ok(HeaderDecision::Continue)
    }

    fn on_payload_file(
        &mut self,
        payload_index: usize,
        file: &mut PayloadFile<'_>,
    ) -> mender_artifact::Result<()> {
        let dir = work_dir_for(&self.config, payload_index).join("files");
        let path = dir.join(file.name());
        debug!("staging payload file {} ({} bytes)", path.display(), file.size());

        let mut out = File::create(&path)?;
        std::io::copy(file, &mut out)?;
        out.flush()?;
        self.staged_files += 1;
        Ok(())
    }
}

/// Parses the artifact file, verifying checksums and signature per policy,
/// evaluates its depends against the given provides, and stages payload
/// files plus module header files into the per-payload work directories.
///
/// Synchronous; run it on a blocking thread from async contexts.
pub fn stage_artifact(
    config: &MenderConfig,
    parser_config: &ParserConfig,
    artifact_file: &Path,
    device_type: &str,
    provides: &BTreeMap<String, String>,
) -> Result<StagedInstall> {
    let file = File::open(artifact_file)?;
    let mut handler = StagingHandler {
        config: config.clone(),
        device_type: device_type.to_string(),
        provides: provides.clone(),
        incompatible: None,
        staged_files: 0,
    };

    let artifact = mender_artifact::parse(BufReader::new(file), parser_config, &mut handler)?;
    if handler.incompatible.is_none() {
        info!(
            "staged artifact {} with {} payload file(s)",
            artifact.name(),
            handler.staged_files
        );
    }

    Ok(StagedInstall {
        artifact,
        incompatible: handler.incompatible,
    })
}

/// Builds the persistent record for a fresh install of `artifact`, entering
/// at `in_state`.
pub fn state_data_from_artifact(artifact: &Artifact, in_state: &str) -> StateData {
    let mut provides: BTreeMap<String, String> = BTreeMap::new();
    let mut clears: Vec<String> = Vec::new();
    let mut payload_types = Vec::new();

    for sub_header in &artifact.header.sub_headers {
        payload_types.push(sub_header.type_info.type_name.clone());
        if let Some(extra) = &sub_header.type_info.artifact_provides {
            for (key, value) in extra {
                provides.insert(key.clone(), value.clone());
            }
        }
        if let Some(extra) = &sub_header.type_info.clears_artifact_provides {
            for pattern in extra {
                if !clears.contains(pattern) {
                    clears.push(pattern.clone());
                }
            }
        }
    }

    StateData {
        version: STATE_DATA_VERSION,
        artifact_name: artifact.name().to_string(),
        artifact_group: artifact.group().unwrap_or_default().to_string(),
        artifact_provides: (!provides.is_empty()).then_some(provides),
        artifact_clears_provides: (!clears.is_empty()).then_some(clears),
        payload_types,
        in_state: in_state.to_string(),
        failed: false,
        rolled_back: false,
    }
}
