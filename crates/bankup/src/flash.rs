//! Flash bank driver.
//!
//! A device boots from one of exactly two flash banks; the other is the
//! update target. This module carries per-bank geometry (offset, size,
//! minimum write block), whole-bank erase, block-padded writes, and
//! active/passive bank resolution from a boot-source offset hint.
//!
//! The underlying flash may reject partial-block writes, so image writes
//! happen in two phases: the largest block-multiple prefix goes out
//! directly, and any remainder is copied into a zero-padded block-sized
//! buffer written as the final block.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::OtaError;

/// Static geometry of one flash bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankGeometry {
    /// Device path (e.g. `/dev/mtd4`).
    pub device: PathBuf,
    /// Byte offset of this bank in the storage address space.
    pub offset: u64,
    /// Total bank size in bytes.
    pub size: u64,
    /// Minimum write granularity in bytes.
    pub block_size: u64,
}

impl BankGeometry {
    /// Whether an address-space offset falls inside this bank.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset + self.size
    }
}

/// One writable flash bank.
///
/// `write` appends sequentially from the start of the bank; callers erase
/// first and feed only block-aligned buffers (the [`BankSet`] padding logic
/// guarantees this).
pub trait FlashBank: Send {
    fn geometry(&self) -> &BankGeometry;
    fn erase(&mut self) -> Result<(), OtaError>;
    fn write(&mut self, data: &[u8]) -> Result<(), OtaError>;
}

/// The configured set of flash banks.
///
/// Exactly two banks are required; extra banks are accepted but ignored.
/// The maximum installable image size is the smallest bank size across all
/// configured banks, a conservative shared ceiling.
pub struct BankSet {
    banks: Vec<Box<dyn FlashBank>>,
    max_image_size: u64,
}

impl BankSet {
    pub fn new(banks: Vec<Box<dyn FlashBank>>) -> Result<Self, OtaError> {
        if banks.len() < 2 {
            return Err(OtaError::InsufficientBanks(banks.len()));
        }
        if banks.len() > 2 {
            warn!(
                configured = banks.len(),
                "more than two banks configured, extras are ignored"
            );
        }
        for bank in &banks {
            let geometry = bank.geometry();
            if geometry.block_size == 0 || geometry.size == 0 {
                return Err(OtaError::DeviceProbe {
                    device: geometry.device.display().to_string(),
                    reason: "zero block size or bank size".to_string(),
                });
            }
        }

        let max_image_size = banks
            .iter()
            .map(|b| b.geometry().size)
            .min()
            .unwrap_or(0);
        info!(max_image_size, "flash banks initialized");

        Ok(Self {
            banks,
            max_image_size,
        })
    }

    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    pub fn geometry(&self, index: usize) -> &BankGeometry {
        self.banks[index].geometry()
    }

    /// The conservative shared image-size ceiling.
    pub fn max_image_size(&self) -> u64 {
        self.max_image_size
    }

    /// Resolve the currently-running bank from a boot-source offset hint.
    ///
    /// The hint is mapped to the bank whose `[offset, offset+size)` range
    /// contains it. An absent or unmappable hint falls back to the first
    /// configured bank with a loud diagnostic — picking the wrong bank here
    /// would let an update overwrite the running firmware, so this fallback
    /// is an accepted operational risk, not a safety contract.
    pub fn active_bank(&self, boot_hint: Option<u64>) -> usize {
        match boot_hint {
            Some(hint) => match self
                .banks
                .iter()
                .position(|b| b.geometry().contains(hint))
            {
                Some(index) => index,
                None => {
                    error!(
                        hint,
                        "boot offset hint maps to no configured bank, assuming first bank is active"
                    );
                    0
                }
            },
            None => {
                error!("no boot offset hint available, assuming first bank is active");
                0
            }
        }
    }

    /// The configured bank set minus the active bank.
    pub fn passive_bank(&self, active: usize) -> usize {
        // Construction guarantees at least two banks
        (0..self.banks.len())
            .find(|&i| i != active)
            .unwrap_or(0)
    }

    /// Erase an entire bank. Failures are reported, never retried here.
    pub fn erase(&mut self, index: usize) -> Result<(), OtaError> {
        let device = self.banks[index].geometry().device.clone();
        info!(device = %device.display(), "erasing bank");
        self.banks[index].erase()
    }

    /// Write an image to a bank with block padding.
    ///
    /// The largest prefix that is an exact multiple of the bank's block
    /// size is written directly; a remainder is zero-padded into one final
    /// block. Total bytes written is `ceil(len / block) * block`.
    pub fn write_image(&mut self, index: usize, data: &[u8]) -> Result<(), OtaError> {
        if data.len() as u64 > self.max_image_size {
            return Err(OtaError::ImageTooLarge {
                size: data.len() as u64,
                max: self.max_image_size,
            });
        }

        let block = self.banks[index].geometry().block_size as usize;
        let tail = data.len() % block;
        let head = data.len() - tail;

        if head > 0 {
            self.banks[index].write(&data[..head])?;
        }
        if tail > 0 {
            let mut padded = vec![0u8; block];
            padded[..tail].copy_from_slice(&data[head..]);
            self.banks[index].write(&padded)?;
        }

        info!(
            device = %self.banks[index].geometry().device.display(),
            bytes = data.len(),
            "image written"
        );
        Ok(())
    }
}

/// Read a boot-source offset hint from a small file holding the decimal
/// byte offset of the currently booted partition. Returns `None` when the
/// file is missing or unparseable.
pub fn read_boot_offset_hint(path: &Path) -> Option<u64> {
    let text = fs::read_to_string(path).ok()?;
    match text.trim().parse::<u64>() {
        Ok(offset) => Some(offset),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unparseable boot offset hint");
            None
        }
    }
}

/// A file-backed flash bank.
///
/// Used in tests and bench setups; behaves like a well-mannered flash
/// device with the given geometry.
pub struct FileBank {
    geometry: BankGeometry,
    file: fs::File,
}

impl FileBank {
    /// Create (or truncate) a backing file with the given geometry.
    pub fn create(
        path: &Path,
        offset: u64,
        size: u64,
        block_size: u64,
    ) -> Result<Self, OtaError> {
        let file = fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            geometry: BankGeometry {
                device: path.to_path_buf(),
                offset,
                size,
                block_size,
            },
            file,
        })
    }
}

impl FlashBank for FileBank {
    fn geometry(&self) -> &BankGeometry {
        &self.geometry
    }

    fn erase(&mut self) -> Result<(), OtaError> {
        use std::io::{Seek, SeekFrom};
        // Rewind too: the file stays open across cycles, and a retried
        // write must start at the bank start, not the prior cursor
        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .map(|_| ())
            .map_err(|e| OtaError::EraseFailed {
                device: self.geometry.device.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        use std::io::Write;
        self.file
            .write_all(data)
            .map_err(|e| OtaError::WriteFailed {
                device: self.geometry.device.display().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Linux MTD character device bank.
///
/// Geometry is probed at open time with the privileged `MEMGETINFO` ioctl;
/// the bank's address-space offset comes from the partition's sysfs node.
#[cfg(target_os = "linux")]
pub use mtd::MtdBank;

#[cfg(target_os = "linux")]
mod mtd {
    use std::fs;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use tracing::warn;

    use super::{BankGeometry, FlashBank};
    use crate::error::OtaError;

    // struct mtd_info_user from <mtd/mtd-abi.h>
    #[repr(C)]
    #[derive(Default)]
    struct MtdInfoUser {
        mtd_type: u8,
        flags: u32,
        size: u32,
        erasesize: u32,
        writesize: u32,
        oobsize: u32,
        padding: u64,
    }

    // struct erase_info_user from <mtd/mtd-abi.h>
    #[repr(C)]
    struct EraseInfoUser {
        start: u32,
        length: u32,
    }

    const IOC_READ: libc::c_ulong = 2;
    const IOC_WRITE: libc::c_ulong = 1;

    const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
        (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
    }

    // MEMGETINFO = _IOR('M', 1, struct mtd_info_user)
    const MEMGETINFO: libc::c_ulong = ioc(IOC_READ, b'M', 1, std::mem::size_of::<MtdInfoUser>());
    // MEMERASE = _IOW('M', 2, struct erase_info_user)
    const MEMERASE: libc::c_ulong = ioc(IOC_WRITE, b'M', 2, std::mem::size_of::<EraseInfoUser>());

    pub struct MtdBank {
        geometry: BankGeometry,
        file: fs::File,
    }

    impl MtdBank {
        /// Open an MTD character device and probe its geometry.
        pub fn open(device: &Path) -> Result<Self, OtaError> {
            let file = fs::File::options().read(true).write(true).open(device)?;

            let mut info = MtdInfoUser::default();
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), MEMGETINFO, &mut info) };
            if rc == -1 {
                return Err(OtaError::DeviceProbe {
                    device: device.display().to_string(),
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }

            let offset = read_partition_offset(device).unwrap_or_else(|| {
                warn!(device = %device.display(), "no sysfs offset for partition, assuming 0");
                0
            });

            Ok(Self {
                geometry: BankGeometry {
                    device: device.to_path_buf(),
                    offset,
                    size: info.size as u64,
                    block_size: info.writesize as u64,
                },
                file,
            })
        }
    }

    /// The partition's byte offset within the parent device, from sysfs.
    fn read_partition_offset(device: &Path) -> Option<u64> {
        let name = device.file_name()?.to_str()?;
        let text = fs::read_to_string(format!("/sys/class/mtd/{}/offset", name)).ok()?;
        text.trim().parse().ok()
    }

    impl FlashBank for MtdBank {
        fn geometry(&self) -> &BankGeometry {
            &self.geometry
        }

        fn erase(&mut self) -> Result<(), OtaError> {
            let erase = EraseInfoUser {
                start: 0,
                length: self.geometry.size as u32,
            };
            let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), MEMERASE, &erase) };
            if rc == -1 {
                return Err(OtaError::EraseFailed {
                    device: self.geometry.device.display().to_string(),
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }
            // The descriptor survives across cycles; a retried write must
            // start at the bank start, not the prior cursor
            self.file
                .seek(SeekFrom::Start(0))
                .map_err(|e| OtaError::EraseFailed {
                    device: self.geometry.device.display().to_string(),
                    reason: e.to_string(),
                })?;
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
            self.file
                .write_all(data)
                .map_err(|e| OtaError::WriteFailed {
                    device: self.geometry.device.display().to_string(),
                    reason: e.to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn two_banks(dir: &TempDir, size: u64, block: u64) -> BankSet {
        let a = FileBank::create(&dir.path().join("bank-a"), 0, size, block).unwrap();
        let b = FileBank::create(&dir.path().join("bank-b"), size, size, block).unwrap();
        BankSet::new(vec![Box::new(a), Box::new(b)]).unwrap()
    }

    #[test]
    fn test_fewer_than_two_banks_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let a = FileBank::create(&dir.path().join("bank-a"), 0, 100, 4).unwrap();
        assert!(matches!(
            BankSet::new(vec![Box::new(a) as Box<dyn FlashBank>]),
            Err(OtaError::InsufficientBanks(1))
        ));
    }

    #[test]
    fn test_max_image_size_is_smallest_bank() {
        let dir = TempDir::new().unwrap();
        let a = FileBank::create(&dir.path().join("bank-a"), 0, 100, 4).unwrap();
        let b = FileBank::create(&dir.path().join("bank-b"), 100, 60, 4).unwrap();
        let banks = BankSet::new(vec![
            Box::new(a) as Box<dyn FlashBank>,
            Box::new(b) as Box<dyn FlashBank>,
        ])
        .unwrap();
        assert_eq!(banks.max_image_size(), 60);
    }

    #[test]
    fn test_active_bank_resolution_by_hint() {
        let dir = TempDir::new().unwrap();
        let banks = two_banks(&dir, 100, 4);

        // Banks: A at [0,100), B at [100,200); hint 150 lands in B
        assert_eq!(banks.active_bank(Some(150)), 1);
        assert_eq!(banks.passive_bank(1), 0);

        assert_eq!(banks.active_bank(Some(0)), 0);
        assert_eq!(banks.passive_bank(0), 1);
    }

    #[test]
    fn test_active_bank_falls_back_to_first_on_bad_hint() {
        let dir = TempDir::new().unwrap();
        let banks = two_banks(&dir, 100, 4);

        assert_eq!(banks.active_bank(None), 0);
        assert_eq!(banks.active_bank(Some(9999)), 0);
    }

    #[test]
    fn test_write_pads_final_block_with_zeros() {
        let dir = TempDir::new().unwrap();
        let mut banks = two_banks(&dir, 1024, 16);

        let data: Vec<u8> = (1..=37).collect();
        banks.erase(1).unwrap();
        banks.write_image(1, &data).unwrap();

        let written = std::fs::read(dir.path().join("bank-b")).unwrap();
        // ceil(37 / 16) * 16 = 48
        assert_eq!(written.len(), 48);
        assert_eq!(&written[..37], &data[..]);
        assert!(written[37..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_of_exact_block_multiple_is_unpadded() {
        let dir = TempDir::new().unwrap();
        let mut banks = two_banks(&dir, 1024, 16);

        let data = vec![0xAB; 64];
        banks.erase(0).unwrap();
        banks.write_image(0, &data).unwrap();

        let written = std::fs::read(dir.path().join("bank-a")).unwrap();
        assert_eq!(written, data);
    }

    #[test]
    fn test_rewrite_after_erase_starts_at_bank_start() {
        let dir = TempDir::new().unwrap();
        let mut banks = two_banks(&dir, 1024, 16);

        banks.erase(1).unwrap();
        banks.write_image(1, &vec![0x11; 48]).unwrap();

        // A failed cycle retries the same bank next tick; the rewrite must
        // land at the bank start, not after the earlier write
        let data = vec![0x22; 32];
        banks.erase(1).unwrap();
        banks.write_image(1, &data).unwrap();

        let written = std::fs::read(dir.path().join("bank-b")).unwrap();
        assert_eq!(written, data);
    }

    #[test]
    fn test_oversized_image_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut banks = two_banks(&dir, 32, 16);

        let data = vec![0u8; 33];
        assert!(matches!(
            banks.write_image(0, &data),
            Err(OtaError::ImageTooLarge { size: 33, max: 32 })
        ));
    }

    #[test]
    fn test_boot_hint_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("boot-offset");

        assert_eq!(read_boot_offset_hint(&path), None);

        std::fs::write(&path, "1048576\n").unwrap();
        assert_eq!(read_boot_offset_hint(&path), Some(1_048_576));

        std::fs::write(&path, "not a number").unwrap();
        assert_eq!(read_boot_offset_hint(&path), None);
    }
}
