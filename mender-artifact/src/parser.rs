use std::io;
use std::io::Read;

use log::{debug, trace};
use rsa::RsaPublicKey;

use crate::checksum::ChecksumReader;
use crate::error::Error;
use crate::header;
use crate::header::{Header, SubHeader};
use crate::manifest;
use crate::manifest::Manifest;
use crate::tar_stream::{TarEntry, TarStream};
use crate::token::{Compression, Token};
use crate::version;
use crate::version::Version;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    /// Require a signature and at least one configured key validating it.
    Verify,
    /// Ignore the signature entry entirely.
    #[default]
    Skip,
}

#[derive(Default)]
pub struct ParserConfig {
    pub signature_policy: SignaturePolicy,
    /// Ordered verification keys; the first key that validates wins.
    pub verify_keys: Vec<RsaPublicKey>,
}

/// Typed view of a parsed Artifact. Immutable after parse; payload bodies are
/// not part of the view, they stream through [`InstallHandler::on_payload_file`]
/// exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub version: Version,
    pub manifest: Manifest,
    pub signature: Option<Vec<u8>>,
    pub header: Header,
    /// Whether manifest-augment/header-augment entries were present.
    pub augmented: bool,
}

impl Artifact {
    pub fn name(&self) -> &str {
        &self.header.info.provides.artifact_name
    }

    pub fn group(&self) -> Option<&str> {
        self.header.info.provides.artifact_group.as_deref()
    }

    pub fn payload_count(&self) -> usize {
        self.header.info.payloads.len()
    }

    pub fn sub_header(&self, index: usize) -> Result<&SubHeader> {
        if index >= self.header.sub_headers.len() {
            return Err(Error::PayloadIndexOutOfRange {
                index,
                size: self.header.sub_headers.len(),
            });
        }
        Ok(&self.header.sub_headers[index])
    }

    pub fn payload_type(&self, index: usize) -> Result<&str> {
        Ok(&self.sub_header(index)?.type_info.type_name)
    }
}

/// One file of a payload, streaming through a checksum reader bound to the
/// file's manifest entry. Reading past the end raises the integrity error if
/// the body does not match its recorded digest.
pub struct PayloadFile<'a> {
    name: String,
    size: u64,
    reader: ChecksumReader<Box<dyn Read + 'a>>,
}

impl<'a> PayloadFile<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<'a> Read for PayloadFile<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDecision {
    /// Stream the payloads.
    Continue,
    /// Stop after the header; payloads stay unread. Used when dependencies
    /// do not match, or when only the metadata is of interest.
    Stop,
}

pub trait InstallHandler {
    /// Called once after version, manifest, signature and header are all
    /// parsed and verified, before any payload is streamed.
    fn on_header(&mut self, artifact: &Artifact) -> Result<HeaderDecision>;

    /// Called once per payload file, in archive order. The handler may read
    /// the file fully or partially; the parser drains the remainder so the
    /// checksum is always enforced.
    fn on_payload_file(&mut self, payload_index: usize, file: &mut PayloadFile<'_>) -> Result<()>;
}

/// Handler that stops after the header, for metadata-only inspection.
pub struct HeaderOnly;

impl InstallHandler for HeaderOnly {
    fn on_header(&mut self, _artifact: &Artifact) -> Result<HeaderDecision> {
        Ok(HeaderDecision::Stop)
    }

    fn on_payload_file(&mut self, _payload_index: usize, _file: &mut PayloadFile<'_>) -> Result<()> {
        Ok(())
    }
}

pub fn parse_header_only<R: Read>(input: R, config: &ParserConfig) -> Result<Artifact> {
    parse(input, config, &mut HeaderOnly)
}

fn next_or_eof<'a, R: Read>(
    stream: &mut TarStream<'a, R>,
    expected: &str,
) -> Result<TarEntry<'a, R>> {
    stream
        .next_entry()?
        .ok_or_else(|| Error::UnexpectedEof(expected.to_string()))
}

fn read_trimmed_string(reader: &mut impl Read) -> Result<String> {
    let mut buf = String::new();
    reader.read_to_string(&mut buf).map_err(Error::from)?;
    Ok(buf.trim().to_string())
}

/// Single pass over an Artifact byte stream. Drives the outer tokenizer
/// through the fixed entry order, verifies every checksum the manifest
/// records, verifies the manifest signature per the configured policy, and
/// hands the payload file bodies to `handler`.
pub fn parse<R: Read>(
    input: R,
    config: &ParserConfig,
    handler: &mut impl InstallHandler,
) -> Result<Artifact> {
    let mut archive = tar::Archive::new(input);
    let mut stream = TarStream::new(&mut archive)?;

    // version
    let mut entry = next_or_eof(&mut stream, "version")?;
    if Token::from_entry_name(entry.name()) != Token::Version {
        return Err(Error::UnexpectedEntry {
            expected: "version".to_string(),
            got: entry.name().to_string(),
        });
    }
    let mut version_reader = ChecksumReader::new(&mut entry);
    let version = version::parse(&mut version_reader)?;
    io::copy(&mut version_reader, &mut io::sink()).map_err(Error::from)?;
    let version_shasum = version_reader.shasum().unwrap_or_default();
    drop(entry);

    // manifest
    let mut entry = next_or_eof(&mut stream, "manifest")?;
    if Token::from_entry_name(entry.name()) != Token::Manifest {
        return Err(Error::UnexpectedEntry {
            expected: "manifest".to_string(),
            got: entry.name().to_string(),
        });
    }
    let mut manifest = manifest::parse(&mut entry)?;
    debug!("manifest lists {} entries", manifest.len());
    drop(entry);

    // The version entry precedes the manifest, so its digest is checked
    // afterwards.
    match manifest.get("version") {
        None => return Err(Error::MissingManifestEntry("version".to_string())),
        Some(expected) if expected != version_shasum => {
            return Err(Error::ShasumMismatch {
                expected: expected.to_string(),
                calculated: version_shasum,
            });
        }
        Some(_) => {}
    }

    let mut entry = next_or_eof(&mut stream, "header.tar")?;
    let mut token = Token::from_entry_name(entry.name());

    // manifest.sig
    let mut signature = None;
    if token == Token::ManifestSignature {
        let encoded = read_trimmed_string(&mut entry)?;
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .map_err(Error::DecodeSignature)?;
        signature = Some(decoded);
        drop(entry);
        entry = next_or_eof(&mut stream, "header.tar")?;
        token = Token::from_entry_name(entry.name());
    }

    // Signature verification runs before any header content is processed.
    if config.signature_policy == SignaturePolicy::Verify {
        let sig = signature.as_ref().ok_or(Error::SignatureMissing)?;
        crate::verify_sig::verify_with_keys(manifest.shasum_bytes(), sig, &config.verify_keys)
            .map_err(Error::NoVerifyingKey)?;
    }

    // manifest-augment
    let mut augmented = false;
    if token == Token::ManifestAugment {
        augmented = true;
        let augment = manifest::parse(&mut entry)?;
        manifest.extend_from(&augment);
        drop(entry);
        entry = next_or_eof(&mut stream, "header.tar")?;
        token = Token::from_entry_name(entry.name());
    }

    // header.tar[.gz|.xz|.zst]
    let compression = match token {
        Token::Header(compression) => compression,
        _ => {
            return Err(Error::UnexpectedEntry {
                expected: "header.tar".to_string(),
                got: entry.name().to_string(),
            });
        }
    };
    let expected = manifest
        .get("header.tar")
        .ok_or_else(|| Error::MissingManifestEntry("header.tar".to_string()))?
        .to_string();
    let decompressed = compression.decompress(&mut entry)?;
    let mut checked = ChecksumReader::with_expected(decompressed, &expected);
    let header = header::parse(&mut checked)?;
    debug!(
        "parsed header: artifact {} with {} payload(s)",
        header.info.provides.artifact_name,
        header.info.payloads.len()
    );
    io::copy(&mut checked, &mut io::sink()).map_err(Error::from)?;
    drop(checked);
    drop(entry);

    let mut next = stream.next_entry()?;

    // header-augment.tar[.cz]: checked for integrity, the augmented content
    // itself carries nothing the installer consumes.
    if let Some(mut entry) = next.take() {
        if let Token::HeaderAugment(compression) = Token::from_entry_name(entry.name()) {
            augmented = true;
            let expected = manifest
                .get("header-augment.tar")
                .ok_or_else(|| Error::MissingManifestEntry("header-augment.tar".to_string()))?
                .to_string();
            let decompressed = compression.decompress(&mut entry)?;
            let mut checked = ChecksumReader::with_expected(decompressed, &expected);
            io::copy(&mut checked, &mut io::sink()).map_err(Error::from)?;
            drop(checked);
            drop(entry);
            next = stream.next_entry()?;
        } else {
            next = Some(entry);
        }
    }

    let artifact = Artifact {
        version,
        manifest,
        signature,
        header,
        augmented,
    };

    if handler.on_header(&artifact)? == HeaderDecision::Stop {
        return Ok(artifact);
    }

    // data/NNNN.tar[.cz], one per payload, in order
    for index in 0..artifact.payload_count() {
        let expected_name = format!("data/{index:04}.tar");
        let mut entry = match next.take() {
            Some(entry) => entry,
            None => return Err(Error::UnexpectedEof(expected_name)),
        };
        let compression = match Token::from_entry_name(entry.name()) {
            Token::Payload {
                index: entry_index,
                compression,
            } if entry_index == index => compression,
            _ => {
                return Err(Error::UnexpectedEntry {
                    expected: expected_name,
                    got: entry.name().to_string(),
                });
            }
        };

        {
            let decompressed = compression.decompress(&mut entry)?;
            let mut inner_archive = tar::Archive::new(decompressed);
            let mut inner = TarStream::new(&mut inner_archive)?;
            while let Some(file_entry) = inner.next_entry()? {
                let name = file_entry.name().to_string();
                let size = file_entry.size();
                trace!("payload {index} file {name} ({size} bytes)");
                let key = format!("data/{index:04}/{}", Compression::strip_suffix(&name));
                let expected = artifact
                    .manifest
                    .get(&key)
                    .ok_or(Error::MissingManifestEntry(key))?;

                let mut file = PayloadFile {
                    name,
                    size,
                    reader: ChecksumReader::with_expected(Box::new(file_entry), expected),
                };
                handler.on_payload_file(index, &mut file)?;
                // Drain whatever the handler left unread; the checksum check
                // fires at end-of-stream.
                io::copy(&mut file, &mut io::sink()).map_err(Error::from)?;
            }
        }
        drop(entry);

        next = stream.next_entry()?;
    }

    if let Some(entry) = next {
        return Err(Error::TarExtraData(entry.name().to_string()));
    }

    Ok(artifact)
}
