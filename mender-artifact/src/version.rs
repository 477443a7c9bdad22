use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

pub const SUPPORTED_VERSION: i64 = 3;
pub const SUPPORTED_FORMAT: &str = "mender";

// The version entry is a handful of bytes of JSON; anything bigger than this
// is not a version header.
const MAX_VERSION_ENTRY_SIZE: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: i64,
    pub format: String,
}

pub fn parse(reader: &mut impl Read) -> Result<Version> {
    let mut buf = String::new();
    reader
        .take(MAX_VERSION_ENTRY_SIZE)
        .read_to_string(&mut buf)
        .map_err(Error::from)?;

    let version: Version = serde_json::from_str(&buf)
        .map_err(|err| Error::Parse(format!("Failed to parse the version header JSON: {err}")))?;

    if version.version != SUPPORTED_VERSION {
        return Err(Error::UnsupportedVersion(version.version));
    }
    if version.format != SUPPORTED_FORMAT {
        return Err(Error::UnsupportedFormat(version.format));
    }

    Ok(version)
}
