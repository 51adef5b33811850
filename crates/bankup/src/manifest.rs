//! Manifest data model and wire codec.
//!
//! The manifest is a signed catalog of firmware images with a monotonic
//! serial and a timestamp. Serialization uses a fixed field order for
//! reproducibility, but field order is not part of the trust boundary:
//! signatures always cover the exact transmitted byte sequence, so a
//! verifier must hash the bytes it received and never a re-serialization.
//!
//! Deserialization is lenient per image and strict at the root: a
//! structurally invalid image (or one with zero parseable signatures) is
//! dropped with a warning, while a bad root object, missing images array,
//! or non-positive serial aborts the whole parse.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::OtaError;

/// Well-known manifest file name.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Well-known signature bundle file name.
pub const SIG_FILE: &str = "sig.json";

/// Content type expected when fetching manifest and signature bundle.
pub const MANIFEST_CONTENT_TYPE: &str = "application/json";

/// Signature algorithm tag. Closed set; unknown wire tags never construct
/// a value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignatureType {
    #[serde(rename = "rsa-sha256")]
    RsaSha256,
    #[serde(rename = "rsa-sha512")]
    RsaSha512,
}

impl SignatureType {
    /// The canonical wire name of this algorithm.
    pub fn wire_name(&self) -> &'static str {
        match self {
            SignatureType::RsaSha256 => "rsa-sha256",
            SignatureType::RsaSha512 => "rsa-sha512",
        }
    }

    /// Parse a wire name; unknown tags yield `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "rsa-sha256" => Some(SignatureType::RsaSha256),
            "rsa-sha512" => Some(SignatureType::RsaSha512),
            _ => None,
        }
    }
}

/// A signature over some byte sequence. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    #[serde(rename = "type")]
    pub sig_type: SignatureType,
    /// Lowercase base-16 text of the big-endian signature integer.
    pub data: String,
}

/// One firmware image in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    /// Opaque identity; also the name of the backing file in the repository.
    pub uuid: String,
    /// Monotonically-assigned version number.
    pub version: u32,
    /// Byte size of the image body.
    pub size: u64,
    pub enabled: bool,
    /// Repository-side labels; devices ignore them.
    pub tags: Vec<String>,
    /// Signatures over the image body. Always at least one.
    pub signatures: Vec<Signature>,
}

/// The signed catalog of available firmware images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    /// Increases by exactly 1 on every repository mutation. Strictly
    /// positive on the wire; devices only adopt strictly greater serials.
    pub serial: u32,
    /// Seconds since epoch, set on every repository mutation.
    pub timestamp: i64,
    /// Insertion order; not semantically significant.
    pub images: Vec<Image>,
}

impl Manifest {
    /// An empty catalog. Serial 0 is a pre-publication placeholder; the
    /// first re-sign bumps it to 1.
    pub fn new() -> Self {
        Self {
            serial: 0,
            timestamp: 0,
            images: Vec::new(),
        }
    }

    /// Serialize to the wire JSON byte sequence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, OtaError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from wire bytes.
    ///
    /// Invalid images are dropped (with a warning); root-level problems
    /// abort the parse.
    pub fn from_bytes(data: &[u8]) -> Result<Self, OtaError> {
        let root: Value = serde_json::from_slice(data)?;
        let obj = root
            .as_object()
            .ok_or_else(|| OtaError::MalformedManifest("root node should be an object".into()))?;

        let serial = obj
            .get("serial")
            .and_then(Value::as_u64)
            .filter(|&s| s > 0 && s <= u32::MAX as u64)
            .ok_or_else(|| OtaError::MalformedManifest("bad serial".into()))?
            as u32;

        // The timestamp is informational and may be absent.
        let timestamp = obj.get("timestamp").and_then(Value::as_i64).unwrap_or(0);

        let image_values = obj
            .get("images")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                OtaError::MalformedManifest("no images field or field isn't an array".into())
            })?;

        let mut images = Vec::with_capacity(image_values.len());
        for value in image_values {
            match parse_image(value) {
                Some(image) => images.push(image),
                None => warn!("dropping incomplete or invalid image"),
            }
        }

        Ok(Self {
            serial,
            timestamp,
            images,
        })
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_signature(value: &Value) -> Option<Signature> {
    let obj = value.as_object()?;
    let type_name = obj.get("type").and_then(Value::as_str)?;
    let data = obj.get("data").and_then(Value::as_str)?;

    let sig_type = match SignatureType::from_wire(type_name) {
        Some(t) => t,
        None => {
            warn!(sig_type = type_name, "unknown signature type");
            return None;
        }
    };

    Some(Signature {
        sig_type,
        data: data.to_string(),
    })
}

fn parse_image(value: &Value) -> Option<Image> {
    let obj = value.as_object()?;

    let uuid = obj.get("uuid").and_then(Value::as_str)?;
    let version = obj.get("version").and_then(Value::as_u64)?;
    if version > u32::MAX as u64 {
        return None;
    }
    let size = obj.get("size").and_then(Value::as_u64).filter(|&s| s > 0)?;
    let enabled = obj.get("enabled").and_then(Value::as_bool)?;

    let tags = obj
        .get("tags")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let signatures: Vec<Signature> = obj
        .get("signatures")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(parse_signature)
        .collect();
    if signatures.is_empty() {
        warn!(uuid, "image has no usable signatures");
        return None;
    }

    Some(Image {
        uuid: uuid.to_string(),
        version: version as u32,
        size,
        enabled,
        tags,
        signatures,
    })
}

/// Serialize a signature bundle: a bare JSON array of signature objects.
pub fn serialize_signatures(signatures: &[Signature]) -> Result<Vec<u8>, OtaError> {
    Ok(serde_json::to_vec(signatures)?)
}

/// Parse a signature bundle.
///
/// Returns `None` when the array is absent, empty, or unparseable; the
/// caller must treat `None` as "no trust basis, do not proceed".
pub fn deserialize_signatures(data: &[u8]) -> Option<Vec<Signature>> {
    let root: Value = match serde_json::from_slice(data) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse signature json");
            return None;
        }
    };

    let values = root.as_array()?;
    let signatures: Vec<Signature> = values.iter().filter_map(parse_signature).collect();
    if signatures.is_empty() {
        None
    } else {
        Some(signatures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signature() -> Signature {
        Signature {
            sig_type: SignatureType::RsaSha256,
            data: "0badcafe".to_string(),
        }
    }

    fn test_image(uuid: &str, version: u32, enabled: bool) -> Image {
        Image {
            uuid: uuid.to_string(),
            version,
            size: 1024,
            enabled,
            tags: Vec::new(),
            signatures: vec![test_signature()],
        }
    }

    #[test]
    fn test_roundtrip_preserves_serial_timestamp_and_images() {
        let manifest = Manifest {
            serial: 7,
            timestamp: 1_700_000_000,
            images: vec![
                test_image("aaaa", 1, true),
                test_image("bbbb", 2, false),
            ],
        };

        let bytes = manifest.to_bytes().unwrap();
        let parsed = Manifest::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.serial, 7);
        assert_eq!(parsed.timestamp, 1_700_000_000);

        let mut expected: Vec<&str> = manifest.images.iter().map(|i| i.uuid.as_str()).collect();
        let mut actual: Vec<&str> = parsed.images.iter().map(|i| i.uuid.as_str()).collect();
        expected.sort_unstable();
        actual.sort_unstable();
        assert_eq!(expected, actual);
        assert_eq!(parsed.images, manifest.images);
    }

    #[test]
    fn test_wire_field_names() {
        let manifest = Manifest {
            serial: 1,
            timestamp: 42,
            images: vec![test_image("aaaa", 3, true)],
        };
        let text = String::from_utf8(manifest.to_bytes().unwrap()).unwrap();

        // Fixed field order: serial, timestamp, images
        assert!(text.starts_with(r#"{"serial":1,"timestamp":42,"images":"#));
        assert!(text.contains(r#""type":"rsa-sha256""#));
        assert!(text.contains(r#""uuid":"aaaa""#));
    }

    #[test]
    fn test_root_must_be_object() {
        assert!(matches!(
            Manifest::from_bytes(b"[1,2,3]"),
            Err(OtaError::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_serial_must_be_positive() {
        let bad = br#"{"serial":0,"timestamp":1,"images":[]}"#;
        assert!(matches!(
            Manifest::from_bytes(bad),
            Err(OtaError::MalformedManifest(_))
        ));

        let negative = br#"{"serial":-3,"timestamp":1,"images":[]}"#;
        assert!(Manifest::from_bytes(negative).is_err());
    }

    #[test]
    fn test_missing_images_array_is_fatal() {
        let bad = br#"{"serial":1,"timestamp":1}"#;
        assert!(matches!(
            Manifest::from_bytes(bad),
            Err(OtaError::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_invalid_image_is_dropped_not_fatal() {
        let json = br#"{"serial":3,"timestamp":9,"images":[
            {"uuid":"good","version":1,"size":10,"enabled":true,
             "signatures":[{"type":"rsa-sha256","data":"aa"}]},
            {"uuid":"no-signatures","version":2,"size":10,"enabled":true,
             "signatures":[]},
            {"uuid":"zero-size","version":3,"size":0,"enabled":true,
             "signatures":[{"type":"rsa-sha256","data":"aa"}]},
            "not an object"
        ]}"#;

        let manifest = Manifest::from_bytes(json).unwrap();
        assert_eq!(manifest.serial, 3);
        assert_eq!(manifest.images.len(), 1);
        assert_eq!(manifest.images[0].uuid, "good");
    }

    #[test]
    fn test_image_with_only_unknown_signature_types_is_dropped() {
        let json = br#"{"serial":1,"timestamp":0,"images":[
            {"uuid":"x","version":1,"size":10,"enabled":true,
             "signatures":[{"type":"dsa-sha1","data":"aa"}]}
        ]}"#;
        let manifest = Manifest::from_bytes(json).unwrap();
        assert!(manifest.images.is_empty());
    }

    #[test]
    fn test_unknown_signature_types_are_skipped_within_image() {
        let json = br#"{"serial":1,"timestamp":0,"images":[
            {"uuid":"x","version":1,"size":10,"enabled":true,
             "signatures":[{"type":"dsa-sha1","data":"aa"},
                           {"type":"rsa-sha512","data":"bb"}]}
        ]}"#;
        let manifest = Manifest::from_bytes(json).unwrap();
        assert_eq!(manifest.images.len(), 1);
        assert_eq!(manifest.images[0].signatures.len(), 1);
        assert_eq!(
            manifest.images[0].signatures[0].sig_type,
            SignatureType::RsaSha512
        );
    }

    #[test]
    fn test_signature_bundle_roundtrip() {
        let bundle = vec![
            Signature {
                sig_type: SignatureType::RsaSha256,
                data: "aa".into(),
            },
            Signature {
                sig_type: SignatureType::RsaSha512,
                data: "bb".into(),
            },
        ];
        let bytes = serialize_signatures(&bundle).unwrap();
        let parsed = deserialize_signatures(&bytes).unwrap();
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn test_signature_bundle_rejects_non_array_empty_and_garbage() {
        assert!(deserialize_signatures(b"{}").is_none());
        assert!(deserialize_signatures(b"[]").is_none());
        assert!(deserialize_signatures(b"not json").is_none());
        // An array with only unparseable entries is equally untrusted
        assert!(deserialize_signatures(br#"[{"type":"dsa-sha1","data":"aa"}]"#).is_none());
    }
}
