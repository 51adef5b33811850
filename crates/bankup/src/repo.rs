//! Signed firmware repository.
//!
//! A repository is a directory holding image blobs named by uuid, the
//! manifest catalog (`manifest.json`), the detached signature bundle over
//! its exact bytes (`sig.json`), and the signing keypair. Every mutation
//! runs load → mutate → re-sign → persist: the serial increments by
//! exactly one, the timestamp is refreshed, both signature algorithms are
//! applied, and the manifest lands on disk before the bundle so a crash
//! window never leaves a bundle endorsing bytes that were not yet written.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::crypto::{self, Keypair};
use crate::error::OtaError;
use crate::manifest::{
    serialize_signatures, Image, Manifest, SignatureType, MANIFEST_FILE, SIG_FILE,
};

/// Every repository signature covers both algorithms.
pub const SIGNING_TYPES: [SignatureType; 2] =
    [SignatureType::RsaSha256, SignatureType::RsaSha512];

/// A firmware repository rooted at a directory.
pub struct Repository {
    dir: PathBuf,
    keys: Keypair,
    manifest: Manifest,
}

impl Repository {
    /// Open a repository directory, creating it if absent.
    ///
    /// A missing manifest yields an empty catalog; a corrupt one is
    /// treated the same way with a warning, since the authoritative
    /// content is re-signed and rewritten on the next mutation anyway.
    pub fn open(dir: &Path, keys: Keypair) -> Result<Self, OtaError> {
        fs::create_dir_all(dir)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            match fs::read(&manifest_path).map_err(OtaError::from).and_then(|d| Manifest::from_bytes(&d)) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(error = %e, "manifest unreadable, starting from an empty catalog");
                    Manifest::new()
                }
            }
        } else {
            Manifest::new()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            keys,
            manifest,
        })
    }

    /// The current catalog.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The repository directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The on-disk path of an image blob.
    pub fn image_path(&self, uuid: &str) -> PathBuf {
        self.dir.join(uuid)
    }

    /// Add an image to the catalog.
    ///
    /// Rejects a version that already exists, and content whose freshly
    /// computed signatures match an existing entry's (signing is
    /// deterministic per content, so equal bytes produce equal signature
    /// values). On success the blob is written under its uuid and the
    /// catalog is re-signed and persisted.
    pub fn add(
        &mut self,
        uuid: &str,
        version: u32,
        data: &[u8],
        enabled: bool,
        tags: Vec<String>,
    ) -> Result<(), OtaError> {
        if self.manifest.images.iter().any(|i| i.version == version) {
            return Err(OtaError::DuplicateVersion(version));
        }

        let mut signatures = Vec::with_capacity(SIGNING_TYPES.len());
        for sig_type in SIGNING_TYPES {
            signatures.push(crypto::sign(sig_type, &self.keys, data)?);
        }

        if self.manifest.images.iter().any(|existing| {
            existing
                .signatures
                .iter()
                .any(|s| signatures.iter().any(|n| n == s))
        }) {
            return Err(OtaError::DuplicateContent);
        }

        fs::write(self.image_path(uuid), data)?;

        self.manifest.images.push(Image {
            uuid: uuid.to_string(),
            version,
            size: data.len() as u64,
            enabled,
            tags,
            signatures,
        });

        info!(uuid, version, bytes = data.len(), "image added");
        self.resign_and_persist()
    }

    /// Remove an image by catalog index.
    ///
    /// The blob file stays behind as a dangling file; `repair` cleans
    /// those up.
    pub fn delete(&mut self, index: usize) -> Result<(), OtaError> {
        if index >= self.manifest.images.len() {
            return Err(OtaError::BadImageIndex {
                index,
                len: self.manifest.images.len(),
            });
        }

        let image = self.manifest.images.remove(index);
        info!(uuid = image.uuid, version = image.version, "image deleted");
        self.resign_and_persist()
    }

    /// Flip an image's enabled flag by catalog index.
    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> Result<(), OtaError> {
        let len = self.manifest.images.len();
        let image = self
            .manifest
            .images
            .get_mut(index)
            .ok_or(OtaError::BadImageIndex { index, len })?;

        image.enabled = enabled;
        info!(uuid = image.uuid, enabled, "image flag changed");
        self.resign_and_persist()
    }

    /// Check every catalog entry's signatures against its blob bytes.
    ///
    /// Returns the uuids that fail: missing blob, wrong length, or any
    /// signature that does not verify.
    pub fn verify(&self) -> Vec<String> {
        let mut bad = Vec::new();
        for image in &self.manifest.images {
            let data = match fs::read(self.image_path(&image.uuid)) {
                Ok(data) => data,
                Err(e) => {
                    warn!(uuid = image.uuid, error = %e, "image blob unreadable");
                    bad.push(image.uuid.clone());
                    continue;
                }
            };
            if data.len() as u64 != image.size
                || !crypto::verify_all(&image.signatures, self.keys.public(), &data)
            {
                warn!(uuid = image.uuid, "image failed verification");
                bad.push(image.uuid.clone());
            }
        }
        bad
    }

    /// Repair structural damage; returns whether anything changed.
    ///
    /// Three passes: delete files that no catalog entry claims, drop every
    /// image of any version that appears more than once (no basis to pick
    /// a survivor), and drop entries whose blob is missing. The catalog is
    /// re-signed only when entries were dropped.
    pub fn repair(&mut self) -> Result<bool, OtaError> {
        let mut changed = false;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_well_known(&name) {
                continue;
            }
            if !self.manifest.images.iter().any(|i| i.uuid == name) {
                warn!(file = %name, "deleting dangling repository file");
                fs::remove_file(entry.path())?;
                changed = true;
            }
        }

        let before = self.manifest.images.len();
        let dir = self.dir.clone();

        let duplicated: Vec<u32> = self
            .manifest
            .images
            .iter()
            .filter(|a| {
                self.manifest
                    .images
                    .iter()
                    .filter(|b| b.version == a.version)
                    .count()
                    > 1
            })
            .map(|i| i.version)
            .collect();
        self.manifest.images.retain(|i| {
            if duplicated.contains(&i.version) {
                warn!(uuid = i.uuid, version = i.version, "dropping duplicated version");
                // Take the blob with the entry, or the next repair would
                // find it dangling and report a change again
                if let Err(e) = fs::remove_file(dir.join(&i.uuid)) {
                    warn!(uuid = i.uuid, error = %e, "blob of duplicated version already gone");
                }
                false
            } else {
                true
            }
        });

        self.manifest.images.retain(|i| {
            if dir.join(&i.uuid).exists() {
                true
            } else {
                warn!(uuid = i.uuid, "dropping catalog entry with missing blob");
                false
            }
        });

        if self.manifest.images.len() != before {
            changed = true;
            self.resign_and_persist()?;
        }

        Ok(changed)
    }

    /// Bump the serial, refresh the timestamp, sign, and persist.
    ///
    /// Manifest first, bundle second, each through a temp-file rename.
    fn resign_and_persist(&mut self) -> Result<(), OtaError> {
        self.manifest.serial += 1;
        self.manifest.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let manifest_bytes = self.manifest.to_bytes()?;

        let mut bundle = Vec::with_capacity(SIGNING_TYPES.len());
        for sig_type in SIGNING_TYPES {
            bundle.push(crypto::sign(sig_type, &self.keys, &manifest_bytes)?);
        }

        write_atomic(&self.dir.join(MANIFEST_FILE), &manifest_bytes)?;
        write_atomic(&self.dir.join(SIG_FILE), &serialize_signatures(&bundle)?)?;

        info!(serial = self.manifest.serial, "catalog re-signed and persisted");
        Ok(())
    }
}

/// Files the repair pass never treats as dangling.
fn is_well_known(name: &str) -> bool {
    matches!(
        name,
        MANIFEST_FILE | SIG_FILE | crypto::PUBLIC_KEY_FILE | crypto::PRIVATE_KEY_FILE
    )
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), OtaError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keypair;
    use crate::manifest::deserialize_signatures;
    use tempfile::TempDir;

    fn open_repo(dir: &TempDir) -> Repository {
        Repository::open(dir.path(), test_keypair().clone()).unwrap()
    }

    #[test]
    fn test_add_persists_signed_manifest() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);

        repo.add("img-a", 1, b"firmware one", true, vec!["beta".into()])
            .unwrap();

        assert_eq!(repo.manifest().serial, 1);
        assert_eq!(repo.manifest().images.len(), 1);
        assert_eq!(
            std::fs::read(dir.path().join("img-a")).unwrap(),
            b"firmware one"
        );

        // The bundle must verify over the exact persisted manifest bytes
        let manifest_bytes = std::fs::read(dir.path().join(MANIFEST_FILE)).unwrap();
        let bundle =
            deserialize_signatures(&std::fs::read(dir.path().join(SIG_FILE)).unwrap()).unwrap();
        assert!(crypto::verify_all(
            &bundle,
            test_keypair().public(),
            &manifest_bytes
        ));
    }

    #[test]
    fn test_serial_increments_once_per_mutation() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);

        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();
        repo.add("img-b", 2, b"two", true, Vec::new()).unwrap();
        assert_eq!(repo.manifest().serial, 2);

        repo.delete(0).unwrap();
        assert_eq!(repo.manifest().serial, 3);
    }

    #[test]
    fn test_duplicate_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);

        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();
        assert!(matches!(
            repo.add("img-b", 1, b"different bytes", true, Vec::new()),
            Err(OtaError::DuplicateVersion(1))
        ));
        assert_eq!(repo.manifest().images.len(), 1);
    }

    #[test]
    fn test_duplicate_content_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);

        repo.add("img-a", 1, b"same bytes", true, Vec::new()).unwrap();
        assert!(matches!(
            repo.add("img-b", 2, b"same bytes", true, Vec::new()),
            Err(OtaError::DuplicateContent)
        ));
        assert!(!dir.path().join("img-b").exists());
        // Rejected mutation must not bump the serial
        assert_eq!(repo.manifest().serial, 1);
    }

    #[test]
    fn test_delete_removes_entry_and_repair_sweeps_the_blob() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);

        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();
        repo.delete(0).unwrap();

        assert!(repo.manifest().images.is_empty());
        // Blob becomes dangling until repair sweeps it
        assert!(dir.path().join("img-a").exists());
        assert!(repo.repair().unwrap());
        assert!(!dir.path().join("img-a").exists());

        assert!(matches!(
            repo.delete(5),
            Err(OtaError::BadImageIndex { index: 5, len: 0 })
        ));
    }

    #[test]
    fn test_reopen_restores_catalog() {
        let dir = TempDir::new().unwrap();
        {
            let mut repo = open_repo(&dir);
            repo.add("img-a", 1, b"one", false, vec!["tag".into()]).unwrap();
        }

        let repo = open_repo(&dir);
        assert_eq!(repo.manifest().serial, 1);
        assert_eq!(repo.manifest().images[0].uuid, "img-a");
        assert!(!repo.manifest().images[0].enabled);
        assert_eq!(repo.manifest().images[0].tags, vec!["tag".to_string()]);
    }

    #[test]
    fn test_verify_flags_tampered_blob() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);

        repo.add("img-a", 1, b"good bytes", true, Vec::new()).unwrap();
        repo.add("img-b", 2, b"other bytes", true, Vec::new()).unwrap();
        assert!(repo.verify().is_empty());

        std::fs::write(dir.path().join("img-a"), b"bad  bytes").unwrap();
        assert_eq!(repo.verify(), vec!["img-a".to_string()]);
    }

    #[test]
    fn test_repair_deletes_dangling_files() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);
        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();

        std::fs::write(dir.path().join("orphan"), b"junk").unwrap();
        assert!(repo.repair().unwrap());
        assert!(!dir.path().join("orphan").exists());
        // Catalog untouched, so no re-sign happened
        assert_eq!(repo.manifest().serial, 1);
        assert!(dir.path().join("img-a").exists());
    }

    #[test]
    fn test_repair_drops_entries_with_missing_blobs() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);
        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();
        repo.add("img-b", 2, b"two", true, Vec::new()).unwrap();

        std::fs::remove_file(dir.path().join("img-a")).unwrap();
        assert!(repo.repair().unwrap());

        assert_eq!(repo.manifest().images.len(), 1);
        assert_eq!(repo.manifest().images[0].uuid, "img-b");
        assert_eq!(repo.manifest().serial, 3);
    }

    #[test]
    fn test_repair_drops_all_images_of_a_duplicated_version() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);
        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();
        repo.add("img-b", 2, b"two", true, Vec::new()).unwrap();

        // Forge a version collision the normal path cannot produce
        let mut forged = repo.manifest().images[0].clone();
        forged.uuid = "img-c".to_string();
        std::fs::write(dir.path().join("img-c"), b"one").unwrap();
        repo.manifest.images.push(forged);

        assert!(repo.repair().unwrap());
        assert_eq!(repo.manifest().images.len(), 1);
        assert_eq!(repo.manifest().images[0].uuid, "img-b");
        // Blobs of the dropped entries went with them
        assert!(!dir.path().join("img-a").exists());
        assert!(!dir.path().join("img-c").exists());
    }

    #[test]
    fn test_repair_after_duplicate_version_drop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);
        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();
        repo.add("img-b", 2, b"two", true, Vec::new()).unwrap();

        let mut forged = repo.manifest().images[0].clone();
        forged.uuid = "img-c".to_string();
        std::fs::write(dir.path().join("img-c"), b"one").unwrap();
        repo.manifest.images.push(forged);

        assert!(repo.repair().unwrap());
        assert!(!repo.repair().unwrap());
    }

    #[test]
    fn test_repair_on_clean_repository_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);
        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();

        assert!(!repo.repair().unwrap());
        assert_eq!(repo.manifest().serial, 1);
    }

    #[test]
    fn test_corrupt_manifest_opens_as_empty_catalog() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"not json").unwrap();

        let repo = open_repo(&dir);
        assert_eq!(repo.manifest().serial, 0);
        assert!(repo.manifest().images.is_empty());
    }

    #[test]
    fn test_set_enabled_resigns() {
        let dir = TempDir::new().unwrap();
        let mut repo = open_repo(&dir);
        repo.add("img-a", 1, b"one", true, Vec::new()).unwrap();

        repo.set_enabled(0, false).unwrap();
        assert!(!repo.manifest().images[0].enabled);
        assert_eq!(repo.manifest().serial, 2);
    }
}
