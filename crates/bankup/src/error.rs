//! Error types for the update system.

use thiserror::Error;

/// Errors that can occur during repository and update operations.
///
/// Variants group into the failure classes the system distinguishes:
/// transport (retried next tick), crypto (fatal to the operation),
/// trust and integrity (cycle aborted), storage (cycle aborted, device
/// stays on prior firmware), and catalog invariant violations (mutation
/// rejected).
#[derive(Debug, Error)]
pub enum OtaError {
    /// Fetch returned an unexpected HTTP status
    #[error("fetch of {path} failed with status {status}")]
    FetchStatus { path: String, status: u16 },

    /// Fetch returned an unexpected content type
    #[error("fetch of {path} returned content type {content_type:?}")]
    FetchContentType {
        path: String,
        content_type: Option<String>,
    },

    /// Network error during fetch
    #[error("network error: {0}")]
    Network(String),

    /// RSA key generation failed
    #[error("key generation failed: {0}")]
    Keygen(String),

    /// Key material could not be parsed
    #[error("failed to parse key material: {0}")]
    KeyParse(String),

    /// A sign operation was attempted without the private key half
    #[error("signing requires the private key half")]
    PrivateKeyMissing,

    /// Signing failed inside the RSA primitive
    #[error("signing failed: {0}")]
    Sign(String),

    /// Signature bundle was absent, empty, or unparseable
    #[error("no usable signatures")]
    NoUsableSignatures,

    /// A signature failed to verify
    #[error("signature verification failed for {context}")]
    SignatureRejected { context: String },

    /// Manifest failed structural validation
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// Downloaded image length does not match the manifest-declared size
    #[error("image size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Flash erase failed
    #[error("erase failed on {device}: {reason}")]
    EraseFailed { device: String, reason: String },

    /// Flash write failed
    #[error("write failed on {device}: {reason}")]
    WriteFailed { device: String, reason: String },

    /// Image exceeds the smallest configured bank
    #[error("image of {size} bytes exceeds the smallest bank ({max} bytes)")]
    ImageTooLarge { size: u64, max: u64 },

    /// Fewer than two flash banks configured
    #[error("at least two flash banks must be configured, got {0}")]
    InsufficientBanks(usize),

    /// Flash device could not be probed
    #[error("failed to probe flash device {device}: {reason}")]
    DeviceProbe { device: String, reason: String },

    /// An image with this version already exists in the catalog
    #[error("version {0} already exists in the catalog")]
    DuplicateVersion(u32),

    /// Image content is already present under an existing catalog entry
    #[error("image content already present in the catalog")]
    DuplicateContent,

    /// Catalog index out of range
    #[error("image index {index} out of range ({len} images)")]
    BadImageIndex { index: usize, len: usize },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Reboot trigger failed
    #[error("reboot failed: {0}")]
    Reboot(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for OtaError {
    fn from(err: reqwest::Error) -> Self {
        OtaError::Network(err.to_string())
    }
}
