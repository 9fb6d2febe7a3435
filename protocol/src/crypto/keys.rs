//! # Adjudicator Keys
//!
//! Ed25519 keypairs for adjudicator identities.
//!
//! An adjudicator's address *is* its public key, hex-encoded. There is no
//! separate address derivation: the membership authority hands out hex keys,
//! peers sign with the matching secret, and anyone can verify a contribution
//! knowing nothing but the claimed address.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (thanks, ed25519-dalek).
//! - Key generation uses `OsRng`.
//! - Key bytes are never logged. `Debug` prints the address only.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

/// Errors that can occur during key operations.
///
/// Deliberately vague about *why* something failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid adjudicator address: not a hex-encoded Ed25519 point")]
    InvalidAddress,

    #[error("invalid signature encoding")]
    InvalidSignature,
}

/// An adjudicator signing identity.
///
/// `ArbiterKeypair` does not implement `Serialize`. Exporting a secret should
/// be a deliberate act through [`secret_key_hex`](Self::secret_key_hex).
pub struct ArbiterKeypair {
    signing_key: SigningKey,
}

impl ArbiterKeypair {
    /// Generate a fresh keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Constructs a keypair deterministically from a 32-byte seed.
    ///
    /// Tests and the devnet runner use this to get stable addresses.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct a keypair from a hex-encoded secret key, as written by
    /// `arbiter-node init`.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The adjudicator address: the hex-encoded verifying key.
    pub fn address(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs `message` and returns the hex-encoded signature.
    ///
    /// Ed25519 is deterministic, so the same message always yields the same
    /// signature string. The gossip layer relies on that for idempotent merges.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Exports the secret key as hex. **Handle with care.**
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl Clone for ArbiterKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for ArbiterKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArbiterKeypair(addr={})", self.address())
    }
}

/// Parses an adjudicator address back into its verifying key.
///
/// Rejects anything that is not exactly 32 hex-decoded bytes forming a valid
/// curve point.
pub fn verifying_key_from_address(address: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = hex::decode(address).map_err(|_| KeyError::InvalidAddress)?;
    let arr: [u8; PUBLIC_KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidAddress)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidAddress)
}

/// Decodes a hex signature string into a dalek signature.
pub fn signature_from_hex(signature: &str) -> Result<DalekSignature, KeyError> {
    let bytes = hex::decode(signature).map_err(|_| KeyError::InvalidSignature)?;
    let arr: [u8; SIGNATURE_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidSignature)?;
    Ok(DalekSignature::from_bytes(&arr))
}

/// Verifies a hex signature over `message` against a hex address.
///
/// Returns `false` on any decoding problem. Callers only ever want a yes/no.
pub fn verify_hex(address: &str, message: &[u8], signature: &str) -> bool {
    let (Ok(key), Ok(sig)) = (
        verifying_key_from_address(address),
        signature_from_hex(signature),
    ) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_hex_public_key() {
        let kp = ArbiterKeypair::generate();
        let addr = kp.address();
        assert_eq!(addr.len(), 64);
        assert!(verifying_key_from_address(&addr).is_ok());
    }

    #[test]
    fn sign_and_verify_hex() {
        let kp = ArbiterKeypair::generate();
        let sig = kp.sign_hex(b"round payload");
        assert!(verify_hex(&kp.address(), b"round payload", &sig));
        assert!(!verify_hex(&kp.address(), b"other payload", &sig));
    }

    #[test]
    fn wrong_address_fails() {
        let kp1 = ArbiterKeypair::generate();
        let kp2 = ArbiterKeypair::generate();
        let sig = kp1.sign_hex(b"msg");
        assert!(!verify_hex(&kp2.address(), b"msg", &sig));
    }

    #[test]
    fn signatures_are_deterministic() {
        let kp = ArbiterKeypair::from_seed(&[7u8; 32]);
        assert_eq!(kp.sign_hex(b"same"), kp.sign_hex(b"same"));
    }

    #[test]
    fn garbage_inputs_do_not_verify() {
        let kp = ArbiterKeypair::generate();
        let sig = kp.sign_hex(b"msg");
        assert!(!verify_hex("not-hex", b"msg", &sig));
        assert!(!verify_hex(&kp.address(), b"msg", "abcd"));
        assert!(!verify_hex(&kp.address()[..10], b"msg", &sig));
    }

    #[test]
    fn secret_hex_roundtrip_preserves_address() {
        let kp = ArbiterKeypair::generate();
        let restored = ArbiterKeypair::from_hex(&kp.secret_key_hex()).unwrap();
        assert_eq!(kp.address(), restored.address());
        assert!(matches!(
            ArbiterKeypair::from_hex("zz"),
            Err(KeyError::InvalidSecretKey)
        ));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let kp = ArbiterKeypair::generate();
        let dbg = format!("{:?}", kp);
        assert!(!dbg.contains(&kp.secret_key_hex()));
        assert!(dbg.contains(&kp.address()));
    }
}
