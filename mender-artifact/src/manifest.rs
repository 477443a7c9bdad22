use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;

use regex::Regex;

use crate::checksum::ChecksumReader;
use crate::error::Error;
use crate::token::Compression;
use crate::Result;

const SHASUM_LENGTH: usize = 64;
const WHITESPACE_LENGTH: usize = 2;
const MAX_FILENAME_LENGTH: usize = 100;

/// The per-entry SHA-256 list shipped inside the Artifact. Keys are entry
/// names with any compression suffix stripped; values are lowercase hex
/// digests. The digest of the manifest bytes themselves is retained for
/// signature verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
    shasum: String,
    shasum_bytes: [u8; 32],
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9a-f]{64})[[:space:]]{2}([^[:blank:]]+)$")
            .expect("manifest line regex must compile")
    })
}

fn tokenize(line: &str) -> Result<(String, String)> {
    // Refuse regex matching for too long lines to bound the work the regex
    // engine is handed.
    if line.len() > SHASUM_LENGTH + WHITESPACE_LENGTH + MAX_FILENAME_LENGTH {
        return Err(Error::Parse(format!(
            "Line ({line}) is too long, maximum allowed filename length is {MAX_FILENAME_LENGTH}"
        )));
    }

    let captures = line_regex().captures(line).ok_or_else(|| {
        Error::Parse(format!("Line ({line}) is not in the expected manifest format"))
    })?;

    let shasum = captures[1].to_string();
    let entry_name = Compression::strip_suffix(&captures[2]).to_string();
    Ok((shasum, entry_name))
}

pub fn parse(reader: impl Read) -> Result<Manifest> {
    let mut sha_reader = ChecksumReader::new(reader);
    let mut data = String::new();
    sha_reader.read_to_string(&mut data).map_err(Error::from)?;

    let mut manifest = Manifest {
        shasum: sha_reader.shasum().unwrap_or_default(),
        shasum_bytes: sha_reader.shasum_bytes().unwrap_or_default(),
        ..Default::default()
    };

    for line in data.lines() {
        let (shasum, entry_name) = tokenize(line)?;
        manifest.entries.insert(entry_name, shasum);
    }

    Ok(manifest)
}

impl Manifest {
    pub fn get(&self, entry_name: &str) -> Option<&str> {
        self.entries.get(entry_name).map(String::as_str)
    }

    /// Digest of the manifest file bytes, lowercase hex.
    pub fn shasum(&self) -> &str {
        &self.shasum
    }

    /// Digest of the manifest file bytes, raw. This is what the detached
    /// signature signs.
    pub fn shasum_bytes(&self) -> &[u8; 32] {
        &self.shasum_bytes
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from a manifest-augment file extend the lookup table.
    pub fn extend_from(&mut self, other: &Manifest) {
        for (name, shasum) in other.entries() {
            self.entries.insert(name.to_string(), shasum.to_string());
        }
    }
}
