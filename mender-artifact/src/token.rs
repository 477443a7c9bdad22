use std::io::BufReader;
use std::io::Read;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Error;
use crate::Result;

/// Compression of an individual archive entry, recognized from the entry
/// name suffix. The manifest stores entry names with the suffix stripped, so
/// checksums stay stable across compression choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

pub const COMPRESSION_SUFFIXES: [(&str, Compression); 3] = [
    (".gz", Compression::Gzip),
    (".xz", Compression::Xz),
    (".zst", Compression::Zstd),
];

impl Compression {
    pub fn from_entry_name(name: &str) -> (Compression, &str) {
        for (suffix, compression) in COMPRESSION_SUFFIXES {
            if let Some(stripped) = name.strip_suffix(suffix) {
                return (compression, stripped);
            }
        }
        (Compression::None, name)
    }

    pub fn strip_suffix(name: &str) -> &str {
        Self::from_entry_name(name).1
    }

    pub fn decompress<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        match self {
            Compression::None => Ok(Box::new(reader)),
            Compression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
            Compression::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
            Compression::Zstd => {
                let decoder =
                    zstd::stream::read::Decoder::new(BufReader::new(reader)).map_err(Error::Io)?;
                Ok(Box::new(decoder))
            }
        }
    }
}

/// Token of the outer archive. The entry order is fixed, so the parser only
/// has to recognize names, not decide placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Version,
    Manifest,
    ManifestSignature,
    ManifestAugment,
    Header(Compression),
    HeaderAugment(Compression),
    Payload { index: usize, compression: Compression },
    Unrecognized,
}

fn payload_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("data/")?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl Token {
    pub fn from_entry_name(name: &str) -> Token {
        match name {
            "version" => return Token::Version,
            "manifest" => return Token::Manifest,
            "manifest.sig" => return Token::ManifestSignature,
            "manifest-augment" => return Token::ManifestAugment,
            _ => {}
        }

        let (compression, stripped) = Compression::from_entry_name(name);
        match stripped {
            "header.tar" => Token::Header(compression),
            "header-augment.tar" => Token::HeaderAugment(compression),
            _ => match stripped.strip_suffix(".tar").and_then(payload_index) {
                Some(index) => Token::Payload { index, compression },
                None => Token::Unrecognized,
            },
        }
    }
}

/// Token of the inner header archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderToken {
    HeaderInfo,
    /// Lifecycle script; carries the name with the `scripts/` prefix
    /// stripped.
    Script(String),
    TypeInfo(usize),
    MetaData(usize),
    Unrecognized,
}

fn script_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^scripts/Artifact(Install|Reboot|Rollback|RollbackReboot|Commit|Failure)_(Enter|Leave|Error)_[0-9]{2}(_\S+)?$",
        )
        .expect("script name regex must compile")
    })
}

fn headers_index(name: &str, file: &str) -> Option<usize> {
    let rest = name.strip_prefix("headers/")?;
    let (digits, entry) = rest.split_once('/')?;
    if entry != file || digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl HeaderToken {
    pub fn from_entry_name(name: &str) -> HeaderToken {
        if name == "header-info" {
            return HeaderToken::HeaderInfo;
        }
        if script_regex().is_match(name) {
            // Strip the scripts/ prefix
            return HeaderToken::Script(name["scripts/".len()..].to_string());
        }
        if let Some(index) = headers_index(name, "type-info") {
            return HeaderToken::TypeInfo(index);
        }
        if let Some(index) = headers_index(name, "meta-data") {
            return HeaderToken::MetaData(index);
        }
        HeaderToken::Unrecognized
    }
}
