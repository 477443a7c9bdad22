// Re-exported so dependents name key types without a version of their own.
pub use rsa;

mod checksum;
pub use checksum::ChecksumReader;

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

mod tar_stream;
pub use tar_stream::{TarEntry, TarStream};

mod token;
pub use token::{Compression, HeaderToken, Token};

pub mod header;
pub mod manifest;
pub mod parser;
pub mod verify_sig;
pub mod version;

pub use header::{ArtifactScript, Header, HeaderInfo, SubHeader, TypeInfo};
pub use manifest::Manifest;
pub use parser::{
    parse, parse_header_only, Artifact, HeaderDecision, InstallHandler, ParserConfig, PayloadFile,
    SignaturePolicy,
};
pub use version::Version;
