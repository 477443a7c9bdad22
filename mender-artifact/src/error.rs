use crate::verify_sig;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Parse(String),
    Type(String),
    Json(serde_json::Error),
    ShasumMismatch { expected: String, calculated: String },
    UnsupportedVersion(i64),
    UnsupportedFormat(String),
    UnexpectedEof(String),
    TarExtraData(String),
    UnexpectedEntry { expected: String, got: String },
    MissingManifestEntry(String),
    PayloadIndexOutOfRange { index: usize, size: usize },
    SignatureMissing,
    DecodeSignature(base64::DecodeError),
    NoVerifyingKey(Vec<verify_sig::Error>),
    VerifySignature(verify_sig::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error while reading the Artifact: {err}"),
            Error::Parse(msg) => write!(f, "Parse error: {msg}"),
            Error::Type(msg) => write!(f, "Type error: {msg}"),
            Error::Json(err) => write!(f, "Failed to parse the JSON: {err}"),
            Error::ShasumMismatch {
                expected,
                calculated,
            } => write!(
                f,
                "The checksum of the read byte-stream does not match the expected checksum, (expected): {expected} (calculated): {calculated}"
            ),
            Error::UnsupportedVersion(version) => {
                write!(f, "Only version 3 is supported, received version {version}")
            }
            Error::UnsupportedFormat(format) => write!(
                f,
                "The client only understands the 'mender' Artifact type. Got format: {format}"
            ),
            Error::UnexpectedEof(entry) => {
                write!(f, "Unexpected end of archive, expected {entry}")
            }
            Error::TarExtraData(entry) => {
                write!(f, "Unexpected data after the last payload: {entry}")
            }
            Error::UnexpectedEntry { expected, got } => {
                write!(f, "Unexpected entry `{got}`, expected {expected}")
            }
            Error::MissingManifestEntry(name) => {
                write!(f, "Entry `{name}` is not present in the manifest")
            }
            Error::PayloadIndexOutOfRange { index, size } => {
                write!(f, "Payload index {index} out of range, the Artifact has {size} payloads")
            }
            Error::SignatureMissing => write!(
                f,
                "The Artifact is not signed, but the client is configured to verify signatures"
            ),
            Error::DecodeSignature(err) => {
                write!(f, "Failed to decode the manifest signature: {err}")
            }
            Error::NoVerifyingKey(errs) => {
                write!(f, "None of the configured keys verified the manifest signature: ")?;
                for (i, err) in errs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
            Error::VerifySignature(err) => {
                write!(f, "Failed to verify the manifest signature: {err}")
            }
        }
    }
}

impl From<std::io::Error> for Error {
    // Recovers an Error previously wrapped into an io::Error by the checksum
    // reader, so stream consumers see the typed variant again.
    fn from(err: std::io::Error) -> Self {
        if err.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            match err.into_inner() {
                Some(inner) => match inner.downcast::<Error>() {
                    Ok(recovered) => *recovered,
                    Err(other) => Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, other)),
                },
                None => Error::Io(std::io::Error::from(std::io::ErrorKind::InvalidData)),
            }
        } else {
            Error::Io(err)
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}
