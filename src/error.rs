//! Error taxonomy for the manifest engine.
//!
//! Mirrors the `{severity, category, code, data}` shape of the specification's error design:
//! every variant can report its `Severity` and `Category` without the caller having to match on
//! the `Display` string, the way `DashMpdError` in the upstream fetch path instead leans on
//! `anyhow`-style context strings.

use std::fmt;

/// Whether an error should abort the calling operation (`start()`, a `createSegmentIndex()`
/// future) or is merely reported to the host while the scheduler keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Network,
    Manifest,
    Media,
    Drm,
    Player,
}

/// The error type returned throughout this crate.
#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("manifest root element invalid: {0}")]
    ManifestInvalid(String),

    #[error("manifest malformed: {0}")]
    ManifestMalformed(String),

    #[error("unsupported container in DASH representation: {0}")]
    DashUnsupportedContainer(String),

    #[error("HLS playlist is missing the #EXTM3U header")]
    HlsPlaylistHeaderMissing,

    #[error("HLS playlist mixes master and media playlist tags")]
    HlsInvalidPlaylistHierarchy,

    #[error("HLS required attribute missing: {0}")]
    HlsRequiredAttributeMissing(String),

    #[error("HLS required tag missing: {0}")]
    HlsRequiredTagMissing(String),

    #[error("could not guess codecs for HLS stream")]
    HlsCouldNotGuessCodecs,

    #[error("could not guess MIME type for HLS stream")]
    HlsCouldNotGuessMimeType,

    #[error("multiple #EXT-X-MAP media init sections found where only one is expected")]
    HlsMultipleMediaInitSectionsFound,

    #[error("SAMPLE-AES-CTR encrypted MPEG-2 TS is not supported by the playback pipeline")]
    HlsMseEncryptedMp2tNotSupported,

    #[error("AES-128 encrypted HLS content is not supported on this target")]
    HlsAes128EncryptionNotSupported,

    #[error("no WebCrypto-equivalent primitives available on this target")]
    NoWebCryptoApi,

    #[error("operation aborted")]
    OperationAborted,

    #[error("bad HTTP status {status} fetching {uri}")]
    BadHttpStatus { status: u16, uri: String },

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::de::DeError),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ManifestError {
    pub fn severity(&self) -> Severity {
        use ManifestError::*;
        match self {
            OperationAborted => Severity::Recoverable,
            ManifestInvalid(_) | HlsPlaylistHeaderMissing | HlsInvalidPlaylistHierarchy => {
                Severity::Critical
            }
            ManifestMalformed(_) => Severity::Recoverable,
            _ => Severity::Critical,
        }
    }

    pub fn category(&self) -> Category {
        use ManifestError::*;
        match self {
            BadHttpStatus { .. } => Category::Network,
            OperationAborted => Category::Player,
            NoWebCryptoApi | HlsAes128EncryptionNotSupported | HlsMseEncryptedMp2tNotSupported => {
                Category::Drm
            }
            DashUnsupportedContainer(_) => Category::Media,
            Io(_) => Category::Network,
            _ => Category::Manifest,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ManifestError::OperationAborted)
    }

    pub fn manifest_malformed(why: impl fmt::Display) -> Self {
        ManifestError::ManifestMalformed(why.to_string())
    }

    pub fn other(why: impl fmt::Display) -> Self {
        ManifestError::Other(why.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ManifestError>;
