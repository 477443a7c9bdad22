use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::tar_stream::TarStream;
use crate::token::HeaderToken;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadInfo {
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provides {
    pub artifact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depends {
    pub device_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub payloads: Vec<PayloadInfo>,
    pub provides: Provides,
    pub depends: Depends,
}

/// Per-payload type information. `artifact_depends` values may be a single
/// string or a list of accepted values, so they stay loosely typed until the
/// dependency check interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_provides: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_depends: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clears_artifact_provides: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubHeader {
    pub type_info: TypeInfo,
    pub meta_data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A lifecycle script shipped inside the header. The name has the `scripts/`
/// prefix stripped, e.g. `ArtifactInstall_Enter_01_wait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactScript {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub info: HeaderInfo,
    pub sub_headers: Vec<SubHeader>,
    pub scripts: Vec<ArtifactScript>,
}

fn parse_header_info(data: &str) -> Result<HeaderInfo> {
    let info: HeaderInfo = serde_json::from_str(data)
        .map_err(|err| Error::Parse(format!("Failed to parse header-info: {err}")))?;
    if info.depends.device_type.is_empty() {
        return Err(Error::Type(
            "header-info depends: device_type must not be empty".to_string(),
        ));
    }
    Ok(info)
}

fn parse_meta_data(data: &str) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
    if data.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|err| Error::Parse(format!("Failed to parse meta-data: {err}")))?;
    match value {
        serde_json::Value::Object(map) => Ok(Some(map)),
        other => Err(Error::Type(format!(
            "meta-data must be a JSON object, got: {other}"
        ))),
    }
}

/// Parses the decompressed inner header archive. The `header-info` entry
/// must come first; `headers/NNNN/` indices must be dense and in order, with
/// `meta-data` following its own `type-info`.
pub fn parse(reader: impl Read) -> Result<Header> {
    let mut archive = tar::Archive::new(reader);
    let mut stream = TarStream::new(&mut archive)?;

    let mut first = match stream.next_entry()? {
        Some(entry) => entry,
        None => return Err(Error::UnexpectedEof("header-info".to_string())),
    };
    if HeaderToken::from_entry_name(first.name()) != HeaderToken::HeaderInfo {
        return Err(Error::UnexpectedEntry {
            expected: "header-info".to_string(),
            got: first.name().to_string(),
        });
    }
    let mut data = String::new();
    first.read_to_string(&mut data).map_err(Error::from)?;
    drop(first);
    let info = parse_header_info(&data)?;

    let mut sub_headers: Vec<SubHeader> = Vec::new();
    let mut scripts = Vec::new();

    while let Some(mut entry) = stream.next_entry()? {
        match HeaderToken::from_entry_name(entry.name()) {
            HeaderToken::HeaderInfo => {
                return Err(Error::Parse("Duplicate header-info entry".to_string()));
            }
            HeaderToken::Script(name) => {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).map_err(Error::from)?;
                scripts.push(ArtifactScript { name, content });
            }
            HeaderToken::TypeInfo(index) => {
                if index != sub_headers.len() {
                    return Err(Error::Parse(format!(
                        "type-info for payload {index} out of order, expected {}",
                        sub_headers.len()
                    )));
                }
                let mut data = String::new();
                entry.read_to_string(&mut data).map_err(Error::from)?;
                let type_info: TypeInfo = serde_json::from_str(&data)
                    .map_err(|err| Error::Parse(format!("Failed to parse type-info: {err}")))?;
                sub_headers.push(SubHeader {
                    type_info,
                    meta_data: None,
                });
            }
            HeaderToken::MetaData(index) => {
                if index + 1 != sub_headers.len() {
                    return Err(Error::Parse(format!(
                        "meta-data for payload {index} does not follow its type-info"
                    )));
                }
                let mut data = String::new();
                entry.read_to_string(&mut data).map_err(Error::from)?;
                let sub_header = &mut sub_headers[index];
                if sub_header.meta_data.is_some() {
                    return Err(Error::Parse(format!(
                        "Duplicate meta-data for payload {index}"
                    )));
                }
                sub_header.meta_data = parse_meta_data(&data)?;
            }
            HeaderToken::Unrecognized => {
                return Err(Error::Parse(format!(
                    "Unrecognized header entry: {}",
                    entry.name()
                )));
            }
        }
    }

    if sub_headers.len() != info.payloads.len() {
        return Err(Error::Parse(format!(
            "header-info declares {} payload(s) but the header carries {} sub-header(s)",
            info.payloads.len(),
            sub_headers.len()
        )));
    }

    Ok(Header {
        info,
        sub_headers,
        scripts,
    })
}
