use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::types::Address;

/// Length of a raw ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

pub struct KeyPair {
    pub signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new Ed25519 keypair
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        KeyPair { signing_key: SigningKey::generate(&mut csprng) }
    }

    /// Restore a keypair from a 32-byte secret seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        KeyPair { signing_key: SigningKey::from_bytes(&seed) }
    }

    /// The identity this key controls
    pub fn address(&self) -> Address {
        Address(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign an operation digest
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Vec<u8> {
        self.signing_key.sign(digest).to_bytes().to_vec()
    }

    /// Session-key wire form: the key's identity followed by the signature
    pub fn sign_digest_as_session(&self, digest: &[u8; 32]) -> Vec<u8> {
        let mut out = self.address().0.to_vec();
        out.extend_from_slice(&self.sign_digest(digest));
        out
    }

    pub fn public_key_hex(&self) -> String {
        self.address().to_hex()
    }
}

/// Verify a raw 64-byte signature over `digest` by `signer`.
/// Malformed keys or signatures verify as false.
pub fn verify_digest(signer: &Address, digest: &[u8; 32], signature: &[u8]) -> bool {
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let Ok(pubkey) = VerifyingKey::from_bytes(&signer.0) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    pubkey.verify(digest, &signature).is_ok()
}
