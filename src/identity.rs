use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use log::debug;
use tokio::process::Command;

use crate::error::{ClientError, Result};

/// Aggregated key/value output of a device-side script. Repeated keys
/// collect into a list; keys stay lexicographically ordered so the
/// serialized form is stable.
pub type KeyValuesMap = BTreeMap<String, Vec<String>>;

/// Parses `key=value` lines. A line without the delimiter makes the whole
/// input invalid.
pub fn parse_key_values<'a>(lines: impl Iterator<Item = &'a str>, delimiter: char) -> Result<KeyValuesMap> {
    let mut map = KeyValuesMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(delimiter)
            .ok_or_else(|| ClientError::Identity(format!("Invalid data given: '{line}'")))?;
        map.entry(key.to_string()).or_default().push(value.to_string());
    }

    Ok(map)
}

/// Serializes the map with lexicographic keys; single-element lists collapse
/// to a plain string.
pub fn to_json(map: &KeyValuesMap) -> String {
    let mut object = serde_json::Map::new();
    for (key, values) in map {
        let value = if values.len() == 1 {
            serde_json::Value::String(values[0].clone())
        } else {
            serde_json::Value::Array(
                values
                    .iter()
                    .map(|v| serde_json::Value::String(v.clone()))
                    .collect(),
            )
        };
        object.insert(key.clone(), value);
    }
    serde_json::Value::Object(object).to_string()
}

/// Runs the identity script and parses its stdout. The script is assumed to
/// be exclusively owned for the duration of the call.
pub async fn collect(script: &Path) -> Result<KeyValuesMap> {
    let output = Command::new(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| ClientError::Process(format!("failed to run identity script {}: {err}", script.display())))?;

    if !output.status.success() {
        return Err(ClientError::Process(format!(
            "identity script {} returned status {}",
            script.display(),
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!("identity script output: {stdout:?}");
    parse_key_values(stdout.lines(), '=')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_aggregates_repeated_keys() {
        let map = parse_key_values("key1=value1\nkey2=value2\nkey1=value11\n".lines(), '=').unwrap();

        assert_eq!(
            map.get("key1"),
            Some(&vec!["value1".to_string(), "value11".to_string()])
        );
        assert_eq!(map.get("key2"), Some(&vec!["value2".to_string()]));
    }

    #[test]
    fn test_serialized_form_is_stable() {
        let map = parse_key_values("key1=value1\nkey2=value2\nkey1=value11\n".lines(), '=').unwrap();
        assert_eq!(
            to_json(&map),
            r#"{"key1":["value1","value11"],"key2":"value2"}"#
        );
    }

    #[test]
    fn test_invalid_line_is_rejected() {
        let err = parse_key_values("key1=value1\ngarbage\n".lines(), '=').unwrap_err();
        assert!(err.to_string().contains("Invalid data given: 'garbage'"));
    }

    #[test]
    fn test_value_may_contain_delimiter() {
        let map = parse_key_values(["serial=ab=cd"].into_iter(), '=').unwrap();
        assert_eq!(map.get("serial"), Some(&vec!["ab=cd".to_string()]));
    }

    #[tokio::test]
    async fn test_collect_from_script() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("mender-device-identity");
        {
            let mut file = std::fs::File::create(&script).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            writeln!(file, "echo mac=aa:bb:cc:dd:ee:ff").unwrap();
            writeln!(file, "echo sn=1234").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let map = collect(&script).await.unwrap();
        assert_eq!(map.get("mac"), Some(&vec!["aa:bb:cc:dd:ee:ff".to_string()]));
        assert_eq!(map.get("sn"), Some(&vec!["1234".to_string()]));
    }

    #[tokio::test]
    async fn test_collect_from_failing_script() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("mender-device-identity");
        std::fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(collect(&script).await.is_err());
    }
}
