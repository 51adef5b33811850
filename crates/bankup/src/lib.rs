//! # bankup
//!
//! Secure over-the-air firmware updates for dual-bank embedded devices.
//!
//! This crate handles:
//! - A signed manifest catalog of firmware images (RSA-SHA256/RSA-SHA512)
//! - Repository-side integrity operations (add/list/delete/verify/repair)
//! - The device-side polling state machine (fetch, verify, flash, reboot)
//! - Block-aligned writes to the currently-inactive flash bank
//!
//! ## Security
//!
//! A device never boots unverified or stale firmware:
//! - Every signature in the manifest bundle must verify against the pinned
//!   device public key before the manifest is even parsed
//! - Manifest serials are strictly monotonic; a validly-signed but stale
//!   manifest is discarded
//! - Image bodies are length- and signature-checked before any flash write
//! - The active bank is never written; updates only target the passive bank

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod flash;
pub mod manifest;
#[cfg(test)]
mod proptests;
pub mod repo;
pub mod stamp;
pub mod transport;

// Re-export main types for convenience
pub use config::DeviceConfig;
pub use crypto::{Keypair, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};
pub use engine::{EngineOptions, EngineState, PowerControl, UpdateEngine};
pub use error::OtaError;
pub use flash::{read_boot_offset_hint, BankGeometry, BankSet, FileBank, FlashBank};
#[cfg(target_os = "linux")]
pub use flash::MtdBank;
pub use manifest::{
    Image, Manifest, Signature, SignatureType, MANIFEST_CONTENT_TYPE, MANIFEST_FILE, SIG_FILE,
};
pub use repo::Repository;
pub use stamp::{Stamp, STAMP_FILE};
pub use transport::{FetchResponse, HttpTransport, Transport};
