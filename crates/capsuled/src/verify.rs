//! Image verification.
//!
//! A capsule image ships with a sidecar manifest
//! (`<image>.manifest.json`) naming the package, its version, whether it
//! must be mounted through dm-verity, the image digest, and an ed25519
//! signature over `name@version:digest` made with one of the keys
//! provisioned under the trusted keys directory. Everything downstream
//! treats the returned descriptor as trusted input.

use std::io;
use std::path::{Path, PathBuf};

use capsule_common::{CapsuleError, CapsuleImage, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

pub trait ImageVerifier: Send + Sync {
    /// Open a capsule file, check its signature and parse its manifest.
    fn verify(&self, path: &Path) -> Result<CapsuleImage>;
}

/// Manifest sidecar contents.
#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    version: u64,
    #[serde(default)]
    integrity_protected: bool,
    sha256: String,
    key: String,
    signature: String,
}

/// Verifier backed by a directory of trusted public keys
/// (`<keys_dir>/<key>.pub`, 32 bytes hex).
pub struct ManifestVerifier {
    keys_dir: PathBuf,
}

impl ManifestVerifier {
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
        }
    }

    fn fail(path: &Path, reason: impl Into<String>) -> CapsuleError {
        CapsuleError::VerificationFailed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn load_key(&self, path: &Path, key_id: &str) -> Result<VerifyingKey> {
        // The key id doubles as a file name; keep it to a safe alphabet.
        if key_id.is_empty()
            || !key_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Self::fail(path, format!("invalid key id '{key_id}'")));
        }

        let key_path = self.keys_dir.join(format!("{key_id}.pub"));
        let encoded = std::fs::read_to_string(&key_path)
            .map_err(|e| Self::fail(path, format!("unknown signing key '{key_id}': {e}")))?;
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| Self::fail(path, format!("malformed key '{key_id}': {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Self::fail(path, format!("key '{key_id}' has the wrong length")))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| Self::fail(path, format!("unusable key '{key_id}': {e}")))
    }

    fn image_digest(path: &Path) -> Result<String> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| Self::fail(path, format!("cannot open image: {e}")))?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)
            .map_err(|e| Self::fail(path, format!("cannot read image: {e}")))?;
        Ok(hex::encode(hasher.finalize()))
    }
}

impl ImageVerifier for ManifestVerifier {
    fn verify(&self, path: &Path) -> Result<CapsuleImage> {
        let manifest_path = PathBuf::from(format!("{}.manifest.json", path.display()));
        let contents = std::fs::read_to_string(&manifest_path)
            .map_err(|e| Self::fail(path, format!("cannot read manifest: {e}")))?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .map_err(|e| Self::fail(path, format!("malformed manifest: {e}")))?;

        let digest = Self::image_digest(path)?;
        if digest != manifest.sha256 {
            return Err(Self::fail(path, "image digest does not match manifest"));
        }

        let key = self.load_key(path, &manifest.key)?;
        let signature_bytes = hex::decode(manifest.signature.trim())
            .map_err(|e| Self::fail(path, format!("malformed signature: {e}")))?;
        let signature_bytes: [u8; 64] = signature_bytes
            .try_into()
            .map_err(|_| Self::fail(path, "signature has the wrong length"))?;
        let signature = Signature::from_bytes(&signature_bytes);

        let message = format!("{}@{}:{}", manifest.name, manifest.version, manifest.sha256);
        key.verify(message.as_bytes(), &signature)
            .map_err(|_| Self::fail(path, "signature check failed"))?;

        debug!("Verified {} ({}@{})", path.display(), manifest.name, manifest.version);
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(CapsuleImage {
            name: manifest.name,
            version: manifest.version,
            path,
            integrity_protected: manifest.integrity_protected,
        })
    }
}

#[cfg(test)]
pub mod testing {
    //! Helpers for building signed capsule fixtures in tests.

    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::fs;

    pub const TEST_KEY_BYTES: [u8; 32] = [42; 32];

    /// Write a trusted key named `release` into `keys_dir`.
    pub fn install_test_key(keys_dir: &Path) {
        fs::create_dir_all(keys_dir).unwrap();
        let signing = SigningKey::from_bytes(&TEST_KEY_BYTES);
        fs::write(
            keys_dir.join("release.pub"),
            hex::encode(signing.verifying_key().to_bytes()),
        )
        .unwrap();
    }

    /// Write `<path>` and a matching signed manifest sidecar.
    pub fn write_signed_image(path: &Path, name: &str, version: u64, integrity: bool) {
        let payload = format!("capsule image {name}@{version}");
        fs::write(path, &payload).unwrap();

        let digest = hex::encode(Sha256::digest(payload.as_bytes()));
        let signing = SigningKey::from_bytes(&TEST_KEY_BYTES);
        let message = format!("{name}@{version}:{digest}");
        let signature = hex::encode(signing.sign(message.as_bytes()).to_bytes());

        let manifest = serde_json::json!({
            "name": name,
            "version": version,
            "integrity_protected": integrity,
            "sha256": digest,
            "key": "release",
            "signature": signature,
        });
        fs::write(
            format!("{}.manifest.json", path.display()),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{install_test_key, write_signed_image};
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn verifier(dir: &TempDir) -> ManifestVerifier {
        let keys_dir = dir.path().join("keys.d");
        install_test_key(&keys_dir);
        ManifestVerifier::new(keys_dir)
    }

    #[test]
    fn accepts_a_well_signed_image() {
        let dir = TempDir::new().unwrap();
        let image_path = dir.path().join("com.a@2.img");
        write_signed_image(&image_path, "com.a", 2, true);

        let image = verifier(&dir).verify(&image_path).unwrap();
        assert_eq!(image.name, "com.a");
        assert_eq!(image.version, 2);
        assert!(image.integrity_protected);
    }

    #[test]
    fn rejects_a_tampered_image() {
        let dir = TempDir::new().unwrap();
        let image_path = dir.path().join("com.a@2.img");
        write_signed_image(&image_path, "com.a", 2, false);
        fs::write(&image_path, "tampered payload").unwrap();

        let err = verifier(&dir).verify(&image_path).unwrap_err();
        assert!(matches!(err, CapsuleError::VerificationFailed { .. }));
    }

    #[test]
    fn rejects_a_forged_manifest() {
        let dir = TempDir::new().unwrap();
        let image_path = dir.path().join("com.a@2.img");
        write_signed_image(&image_path, "com.a", 2, false);

        // Bump the version without re-signing; the digest still matches,
        // so only the signature check can catch this.
        let manifest_path = format!("{}.manifest.json", image_path.display());
        let doctored = fs::read_to_string(&manifest_path)
            .unwrap()
            .replace("\"version\": 2", "\"version\": 3");
        fs::write(&manifest_path, doctored).unwrap();

        let err = verifier(&dir).verify(&image_path).unwrap_err();
        assert!(matches!(err, CapsuleError::VerificationFailed { .. }));
    }

    #[test]
    fn rejects_an_unknown_key() {
        let dir = TempDir::new().unwrap();
        let image_path = dir.path().join("com.a@2.img");
        write_signed_image(&image_path, "com.a", 2, false);
        let manifest_path = format!("{}.manifest.json", image_path.display());
        let doctored = fs::read_to_string(&manifest_path)
            .unwrap()
            .replace("\"key\": \"release\"", "\"key\": \"vendor\"");
        fs::write(&manifest_path, doctored).unwrap();

        let err = verifier(&dir).verify(&image_path).unwrap_err();
        assert!(matches!(err, CapsuleError::VerificationFailed { .. }));
    }

    #[test]
    fn rejects_a_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let image_path = dir.path().join("com.a@2.img");
        fs::write(&image_path, "payload").unwrap();

        let err = verifier(&dir).verify(&image_path).unwrap_err();
        assert!(matches!(err, CapsuleError::VerificationFailed { .. }));
    }
}
