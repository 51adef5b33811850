//! Device-side update state machine.
//!
//! Each tick runs one poll cycle: fetch the signature bundle, fetch the
//! manifest, verify the bundle over the exact received manifest bytes,
//! adopt the manifest only if its serial is strictly greater than the last
//! adopted one, pick an update candidate, then download, verify, and flash
//! it into the passive bank before requesting a reboot.
//!
//! A chosen candidate is latched: once selected it is pursued until
//! installed, and later manifests are not re-scanned. Any failure aborts
//! the current cycle only; the device keeps running its prior firmware and
//! the next tick retries.

use rsa::RsaPublicKey;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::error::OtaError;
use crate::flash::BankSet;
use crate::manifest::{
    deserialize_signatures, Image, Manifest, MANIFEST_CONTENT_TYPE, MANIFEST_FILE, SIG_FILE,
};
use crate::transport::Transport;

/// Observable engine state, updated as a tick progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No update in progress.
    Idle,
    /// Fetching the signature bundle and the manifest.
    FetchingManifest,
    /// Checking the bundle over the received manifest bytes.
    VerifyingManifest,
    /// Scanning the adopted catalog for an update candidate.
    SelectingCandidate,
    /// Downloading the target image.
    Downloading,
    /// Checking the target image's signatures.
    VerifyingImage,
    /// Erasing and writing the passive bank.
    Flashing,
    /// Update installed; terminal until the process restarts.
    RebootPending,
}

/// Reboot seam; the daemon supplies the real one.
pub trait PowerControl: Send {
    fn reboot(&self) -> Result<(), OtaError>;
}

/// Static engine parameters.
pub struct EngineOptions {
    /// Repository path prefix, e.g. `/ota/spibeagle`.
    pub base_path: String,
    /// Version of the currently running firmware.
    pub current_version: u32,
    /// Accept any enabled image regardless of version.
    pub force: bool,
    /// Stop after verification; never erase, flash, or reboot.
    pub dry_run: bool,
    /// Boot-source offset of the running partition, when known.
    pub boot_hint: Option<u64>,
}

/// The update engine.
pub struct UpdateEngine {
    transport: Box<dyn Transport>,
    power: Box<dyn PowerControl>,
    banks: Option<BankSet>,
    public: RsaPublicKey,
    base_path: String,
    current_version: u32,
    force: bool,
    dry_run: bool,
    boot_hint: Option<u64>,
    state: EngineState,
    last_serial: u32,
    target: Option<Image>,
}

impl UpdateEngine {
    /// Create an engine. `banks` may be `None` only in dry-run mode.
    pub fn new(
        transport: Box<dyn Transport>,
        power: Box<dyn PowerControl>,
        banks: Option<BankSet>,
        public: RsaPublicKey,
        options: EngineOptions,
    ) -> Result<Self, OtaError> {
        if banks.is_none() && !options.dry_run {
            return Err(OtaError::Config(
                "flash banks are required outside dry-run mode".to_string(),
            ));
        }

        Ok(Self {
            transport,
            power,
            banks,
            public,
            base_path: options.base_path,
            current_version: options.current_version,
            force: options.force,
            dry_run: options.dry_run,
            boot_hint: options.boot_hint,
            state: EngineState::Idle,
            last_serial: 0,
            target: None,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The latched update candidate, if any.
    pub fn target(&self) -> Option<&Image> {
        self.target.as_ref()
    }

    /// Run one poll cycle.
    ///
    /// Transport and verification failures are absorbed here: they abort
    /// the cycle with a warning and the engine goes back to waiting for
    /// the next tick. `RebootPending` is terminal.
    pub async fn tick(&mut self) -> EngineState {
        if self.state == EngineState::RebootPending {
            return self.state;
        }

        if self.target.is_none() {
            match self.check_for_update().await {
                Ok(Some(image)) => {
                    info!(
                        uuid = image.uuid,
                        version = image.version,
                        "update candidate latched"
                    );
                    self.target = Some(image);
                }
                Ok(None) => {
                    self.state = EngineState::Idle;
                    return self.state;
                }
                Err(e) => {
                    warn!(error = %e, "update check failed");
                    self.state = EngineState::Idle;
                    return self.state;
                }
            }
        }

        // Latched: pursue the target until it installs.
        if let Some(target) = self.target.clone() {
            if let Err(e) = self.apply_update(&target).await {
                warn!(uuid = target.uuid, error = %e, "update attempt failed, will retry");
                self.state = EngineState::Idle;
            }
        }

        self.state
    }

    /// Fetch bundle and manifest, establish trust, and pick a candidate.
    async fn check_for_update(&mut self) -> Result<Option<Image>, OtaError> {
        self.state = EngineState::FetchingManifest;
        let bundle_bytes = self.fetch(SIG_FILE, Some(MANIFEST_CONTENT_TYPE)).await?;
        let bundle =
            deserialize_signatures(&bundle_bytes).ok_or(OtaError::NoUsableSignatures)?;
        let manifest_bytes = self.fetch(MANIFEST_FILE, Some(MANIFEST_CONTENT_TYPE)).await?;

        self.state = EngineState::VerifyingManifest;
        // Trust covers the exact received bytes, before any parsing.
        if !crypto::verify_all(&bundle, &self.public, &manifest_bytes) {
            return Err(OtaError::SignatureRejected {
                context: MANIFEST_FILE.to_string(),
            });
        }

        let manifest = Manifest::from_bytes(&manifest_bytes)?;
        if manifest.serial <= self.last_serial {
            debug!(
                serial = manifest.serial,
                last = self.last_serial,
                "manifest serial not newer, nothing to do"
            );
            return Ok(None);
        }

        info!(serial = manifest.serial, images = manifest.images.len(), "manifest adopted");
        self.last_serial = manifest.serial;

        self.state = EngineState::SelectingCandidate;
        Ok(select_candidate(&manifest.images, self.current_version, self.force).cloned())
    }

    /// Download, verify, and install the latched target.
    async fn apply_update(&mut self, target: &Image) -> Result<(), OtaError> {
        self.state = EngineState::Downloading;
        let body = self.fetch(&target.uuid, None).await?;
        if body.len() as u64 != target.size {
            return Err(OtaError::SizeMismatch {
                expected: target.size,
                actual: body.len() as u64,
            });
        }

        self.state = EngineState::VerifyingImage;
        if !crypto::verify_all(&target.signatures, &self.public, &body) {
            return Err(OtaError::SignatureRejected {
                context: target.uuid.clone(),
            });
        }

        if self.dry_run {
            info!(uuid = target.uuid, "dry run: image verified, skipping flash and reboot");
            self.state = EngineState::RebootPending;
            return Ok(());
        }

        self.state = EngineState::Flashing;
        let banks = self
            .banks
            .as_mut()
            .ok_or_else(|| OtaError::Config("no flash banks configured".to_string()))?;
        let active = banks.active_bank(self.boot_hint);
        let passive = banks.passive_bank(active);
        banks.erase(passive)?;
        banks.write_image(passive, &body)?;

        info!(
            uuid = target.uuid,
            version = target.version,
            bank = passive,
            "update installed, requesting reboot"
        );
        self.state = EngineState::RebootPending;
        self.power.reboot()?;
        Ok(())
    }

    async fn fetch(&self, name: &str, content_type: Option<&str>) -> Result<Vec<u8>, OtaError> {
        let path = format!("{}/{}", self.base_path, name);
        let response = self.transport.get(&path).await?;
        if response.status != 200 {
            return Err(OtaError::FetchStatus {
                path,
                status: response.status,
            });
        }
        if !response.matches(content_type) {
            return Err(OtaError::FetchContentType {
                path,
                content_type: response.content_type,
            });
        }
        Ok(response.body)
    }
}

/// Pick the update candidate from a catalog.
///
/// Eligible images are enabled and, unless forced, strictly newer than the
/// running version. Among eligible images the highest version wins; on a
/// version tie the earlier catalog entry is kept.
pub(crate) fn select_candidate(
    images: &[Image],
    current_version: u32,
    force: bool,
) -> Option<&Image> {
    let mut best: Option<&Image> = None;
    for image in images {
        if !image.enabled {
            continue;
        }
        if !force && image.version <= current_version {
            continue;
        }
        match best {
            Some(b) if image.version <= b.version => {}
            _ => best = Some(image),
        }
    }
    best
}
