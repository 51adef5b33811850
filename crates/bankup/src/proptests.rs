//! Property tests over the wire codec, candidate selection, and flash
//! padding.

use proptest::prelude::*;

use crate::engine::select_candidate;
use crate::flash::{BankSet, FileBank, FlashBank};
use crate::manifest::{Image, Manifest, Signature, SignatureType};

fn arb_signature() -> impl Strategy<Value = Signature> {
    (
        prop_oneof![
            Just(SignatureType::RsaSha256),
            Just(SignatureType::RsaSha512),
        ],
        "[0-9a-f]{2,64}",
    )
        .prop_map(|(sig_type, data)| Signature { sig_type, data })
}

fn arb_image() -> impl Strategy<Value = Image> {
    (
        "[a-z0-9-]{1,36}",
        1u32..10_000,
        1u64..1_000_000,
        any::<bool>(),
        prop::collection::vec("[a-z]{1,8}", 0..3),
        prop::collection::vec(arb_signature(), 1..3),
    )
        .prop_map(|(uuid, version, size, enabled, tags, signatures)| Image {
            uuid,
            version,
            size,
            enabled,
            tags,
            signatures,
        })
}

fn arb_manifest() -> impl Strategy<Value = Manifest> {
    (
        1u32..u32::MAX,
        any::<i64>(),
        prop::collection::vec(arb_image(), 0..8),
    )
        .prop_map(|(serial, timestamp, images)| Manifest {
            serial,
            timestamp,
            images,
        })
}

proptest! {
    /// Any structurally valid manifest survives the wire codec intact.
    #[test]
    fn prop_manifest_roundtrip(manifest in arb_manifest()) {
        let bytes = manifest.to_bytes().unwrap();
        let parsed = Manifest::from_bytes(&bytes).unwrap();
        prop_assert_eq!(parsed, manifest);
    }

    /// A selected candidate is always enabled, eligible, and no other
    /// eligible image has a higher version.
    #[test]
    fn prop_candidate_is_maximal_and_eligible(
        images in prop::collection::vec(arb_image(), 0..8),
        current in 0u32..10_000,
        force in any::<bool>(),
    ) {
        match select_candidate(&images, current, force) {
            Some(candidate) => {
                prop_assert!(candidate.enabled);
                prop_assert!(force || candidate.version > current);
                for image in &images {
                    if image.enabled && (force || image.version > current) {
                        prop_assert!(image.version <= candidate.version);
                    }
                }
            }
            None => {
                for image in &images {
                    prop_assert!(!image.enabled || (!force && image.version <= current));
                }
            }
        }
    }

    /// Written bank length is always the image length rounded up to a
    /// block multiple, with the prefix byte-identical to the image.
    #[test]
    fn prop_flash_write_rounds_up_to_block_multiple(
        data in prop::collection::vec(any::<u8>(), 1..2048),
        block in prop_oneof![Just(1u64), Just(16u64), Just(64u64), Just(512u64)],
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let a = FileBank::create(&dir.path().join("a"), 0, 4096, block).unwrap();
        let b = FileBank::create(&dir.path().join("b"), 4096, 4096, block).unwrap();
        let mut banks = BankSet::new(vec![
            Box::new(a) as Box<dyn FlashBank>,
            Box::new(b) as Box<dyn FlashBank>,
        ]).unwrap();

        banks.write_image(1, &data).unwrap();

        let written = std::fs::read(dir.path().join("b")).unwrap();
        let expected = (data.len() as u64).div_ceil(block) * block;
        prop_assert_eq!(written.len() as u64, expected);
        prop_assert_eq!(&written[..data.len()], &data[..]);
        prop_assert!(written[data.len()..].iter().all(|&b| b == 0));
    }

    /// Garbage signature text never verifies.
    #[test]
    fn prop_garbage_signatures_never_verify(
        sig in arb_signature(),
        data in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let keys = crate::crypto::test_keypair();
        prop_assert!(!crate::crypto::verify(&sig, keys.public(), &data));
    }
}
