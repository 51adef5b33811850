//! RSA signature engine.
//!
//! Sign and verify primitives over raw byte buffers, plus keypair
//! generation and persistence. Two algorithms are supported, RSA-SHA256
//! and RSA-SHA512; signature values travel as lowercase base-16 text of
//! the big-endian signature integer.
//!
//! # Security
//!
//! - Keys are 2048-bit RSA generated from OS entropy (`OsRng` blocks until
//!   the kernel pool is initialized)
//! - Every sign call draws fresh entropy for side-channel blinding; the
//!   PKCS#1 v1.5 encoding itself stays deterministic, which the repository
//!   relies on for duplicate-content detection
//! - `verify` is a pure predicate: it never errors, it only fails

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, warn};

use crate::error::OtaError;
use crate::manifest::{Signature, SignatureType};

/// Well-known file name of the public key half.
pub const PUBLIC_KEY_FILE: &str = "rsa.pub";

/// Well-known file name of the private key half.
pub const PRIVATE_KEY_FILE: &str = "rsa.priv";

/// RSA modulus size in bits.
pub const RSA_KEY_BITS: usize = 2048;

/// An RSA keypair.
///
/// The repository holds both halves; a device holds only the public half.
/// Without the private half the keypair is in verify-only mode and any
/// sign attempt fails with [`OtaError::PrivateKeyMissing`].
#[derive(Clone)]
pub struct Keypair {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl Keypair {
    /// Generate a fresh 2048-bit keypair from OS entropy.
    ///
    /// Entropy, keygen, or any other failure here is fatal to the call;
    /// no partial keypair is ever returned.
    pub fn generate() -> Result<Self, OtaError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| OtaError::Keygen(e.to_string()))?;
        let public = private.to_public_key();
        Ok(Self {
            public,
            private: Some(private),
        })
    }

    /// Build a verify-only keypair around an existing public key.
    pub fn verify_only(public: RsaPublicKey) -> Self {
        Self {
            public,
            private: None,
        }
    }

    /// The public half.
    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Whether the private half is available for signing.
    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }

    /// Load a keypair from explicit paths.
    ///
    /// The public half is always required. The private half is optional:
    /// `None`, or a path that does not exist, yields a verify-only keypair.
    /// A private key file that exists but cannot be parsed is an error.
    pub fn load_from(pub_path: &Path, priv_path: Option<&Path>) -> Result<Self, OtaError> {
        let pub_pem = fs::read_to_string(pub_path)?;
        let public = RsaPublicKey::from_public_key_pem(&pub_pem)
            .map_err(|e| OtaError::KeyParse(format!("{}: {}", pub_path.display(), e)))?;

        let private = match priv_path {
            Some(path) if path.exists() => {
                let priv_pem = fs::read_to_string(path)?;
                let key = RsaPrivateKey::from_pkcs8_pem(&priv_pem)
                    .map_err(|e| OtaError::KeyParse(format!("{}: {}", path.display(), e)))?;
                Some(key)
            }
            Some(path) => {
                warn!(path = %path.display(), "private key not found, keypair is verify-only");
                None
            }
            None => None,
        };

        Ok(Self { public, private })
    }

    /// Load `rsa.pub` (required) and `rsa.priv` (optional) from a directory.
    pub fn load(keys_dir: &Path) -> Result<Self, OtaError> {
        Self::load_from(
            &keys_dir.join(PUBLIC_KEY_FILE),
            Some(&keys_dir.join(PRIVATE_KEY_FILE)),
        )
    }

    /// Persist the keypair into a directory as `rsa.pub`/`rsa.priv`.
    ///
    /// The public half is written as SPKI PEM, the private half (when
    /// present) as PKCS#8 PEM.
    pub fn save(&self, keys_dir: &Path) -> Result<(), OtaError> {
        fs::create_dir_all(keys_dir)?;

        let pub_pem = self
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| OtaError::KeyParse(e.to_string()))?;
        fs::write(keys_dir.join(PUBLIC_KEY_FILE), pub_pem)?;

        if let Some(private) = &self.private {
            let priv_pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| OtaError::KeyParse(e.to_string()))?;
            fs::write(keys_dir.join(PRIVATE_KEY_FILE), priv_pem.as_bytes())?;
        }

        Ok(())
    }
}

fn digest(sig_type: SignatureType, data: &[u8]) -> Vec<u8> {
    match sig_type {
        SignatureType::RsaSha256 => Sha256::digest(data).to_vec(),
        SignatureType::RsaSha512 => Sha512::digest(data).to_vec(),
    }
}

fn scheme(sig_type: SignatureType) -> Pkcs1v15Sign {
    match sig_type {
        SignatureType::RsaSha256 => Pkcs1v15Sign::new::<Sha256>(),
        SignatureType::RsaSha512 => Pkcs1v15Sign::new::<Sha512>(),
    }
}

/// Sign `data` with the given algorithm.
///
/// Hashes with the algorithm-specified digest, signs the digest with the
/// private key (fresh entropy per call for blinding), and encodes the
/// signature integer as lowercase base-16 text.
pub fn sign(sig_type: SignatureType, keys: &Keypair, data: &[u8]) -> Result<Signature, OtaError> {
    let private = keys.private.as_ref().ok_or(OtaError::PrivateKeyMissing)?;

    let hashed = digest(sig_type, data);
    let raw = private
        .sign_with_rng(&mut OsRng, scheme(sig_type), &hashed)
        .map_err(|e| OtaError::Sign(e.to_string()))?;

    Ok(Signature {
        sig_type,
        data: hex::encode(raw),
    })
}

/// Decode a base-16 big-integer signature value to exactly `key_len` bytes.
///
/// Tolerates odd-length text and short values (leading zeros of the big
/// integer are not carried on the wire). Values wider than the key cannot
/// be valid.
fn decode_signature_value(text: &str, key_len: usize) -> Option<Vec<u8>> {
    let raw = if text.len() % 2 == 1 {
        let mut padded = String::with_capacity(text.len() + 1);
        padded.push('0');
        padded.push_str(text);
        hex::decode(padded).ok()?
    } else {
        hex::decode(text).ok()?
    };

    let raw: &[u8] = {
        let first = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        &raw[first..]
    };
    if raw.len() > key_len {
        return None;
    }

    let mut out = vec![0u8; key_len];
    out[key_len - raw.len()..].copy_from_slice(raw);
    Some(out)
}

/// Verify a signature over `data` against a public key.
///
/// Pure predicate: returns `false` for undecodable signature text or any
/// verification failure; it never errors.
pub fn verify(signature: &Signature, public: &RsaPublicKey, data: &[u8]) -> bool {
    let raw = match decode_signature_value(&signature.data, public.size()) {
        Some(raw) => raw,
        None => {
            debug!(sig_type = signature.sig_type.wire_name(), "undecodable signature value");
            return false;
        }
    };

    let hashed = digest(signature.sig_type, data);
    public
        .verify(scheme(signature.sig_type), &hashed, &raw)
        .is_ok()
}

/// Verify that every signature in a set covers `data`.
///
/// All must verify; the first failure short-circuits the remaining checks.
/// Partial trust is not accepted.
pub fn verify_all<'a, I>(signatures: I, public: &RsaPublicKey, data: &[u8]) -> bool
where
    I: IntoIterator<Item = &'a Signature>,
{
    let mut any = false;
    for sig in signatures {
        any = true;
        debug!(sig_type = sig.sig_type.wire_name(), "checking signature");
        if !verify(sig, public, data) {
            warn!(sig_type = sig.sig_type.wire_name(), "signature check failed");
            return false;
        }
    }
    any
}

/// Shared test keypair; 2048-bit generation is too slow to repeat per test.
#[cfg(test)]
pub(crate) fn test_keypair() -> &'static Keypair {
    use std::sync::OnceLock;
    static KEYS: OnceLock<Keypair> = OnceLock::new();
    KEYS.get_or_init(|| Keypair::generate().expect("test keypair generation"))
}
