use log::{debug, warn};
use mender_api::inventory::INVENTORY_ATTRIBUTES_PATH;
use mender_api::InventoryAttribute;

use crate::auth::{authorized_request, Authenticator};
use crate::config::MenderConfig;
use crate::error::{ClientError, Result};
use crate::identity;
use crate::store::MenderStore;

/// Gathers inventory from every executable in the inventory scripts
/// directory, plus the attributes the client itself knows.
pub async fn collect(config: &MenderConfig, store: &MenderStore) -> Result<Vec<InventoryAttribute>> {
    let mut map = identity::KeyValuesMap::new();

    let dir = &config.paths.inventory_scripts_dir;
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut scripts: Vec<_> = Vec::new();
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
                scripts.push(entry.path());
            }
            scripts.sort();

            for script in scripts {
                match identity::collect(&script).await {
                    Ok(output) => {
                        for (key, mut values) in output {
                            map.entry(key).or_default().append(&mut values);
                        }
                    }
                    // One broken generator must not starve the rest.
                    Err(err) => warn!("inventory script {} failed: {err}", script.display()),
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("inventory scripts directory {} does not exist", dir.display());
        }
        Err(err) => return Err(err.into()),
    }

    map.insert("device_type".to_string(), vec![config.device_type()?]);
    if let Some(name) = store.artifact_name()? {
        map.insert("artifact_name".to_string(), vec![name]);
    }

    Ok(map
        .into_iter()
        .map(|(name, values)| InventoryAttribute {
            name,
            value: values.into(),
        })
        .collect())
}

/// Uploads the full attribute set.
pub async fn submit(
    client: &reqwest::Client,
    auth: &Authenticator,
    attributes: &[InventoryAttribute],
) -> Result<()> {
    let response = authorized_request(auth, |data| {
        let url = format!("{}{INVENTORY_ATTRIBUTES_PATH}", data.server_url);
        client
            .put(&url)
            .bearer_auth(data.token)
            .json(attributes)
            .send()
    })
    .await?;

    if !response.status().is_success() {
        return Err(ClientError::UnexpectedHttpStatus {
            status: response.status().as_u16(),
            url: INVENTORY_ATTRIBUTES_PATH.to_string(),
        });
    }
    Ok(())
}
