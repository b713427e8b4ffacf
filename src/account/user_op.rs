//! Operation envelope and the values authentication hands back to the host.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Write};

use crate::encoding::CanonicalSerialize;
use crate::types::{Address, Amount, Timestamp};

/// Reply of `is_valid_signature` for an accepted signature.
pub const ERC1271_MAGIC_VALUE: [u8; 4] = [0x16, 0x26, 0xba, 0x7e];
/// Reply of `is_valid_signature` for a rejected signature.
pub const ERC1271_INVALID: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Largest timestamp that fits the 48-bit fields of the packed validation word.
pub const MAX_PACKED_TIMESTAMP: Timestamp = (1 << 48) - 1;

/// An operation submitted on behalf of an account by the delegate.
/// Gas and fee fields are carried opaquely.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: u64,
    pub init_code: Vec<u8>,
    pub call_data: Vec<u8>,
    pub call_gas_limit: u64,
    pub verification_gas_limit: u64,
    pub pre_verification_gas: u64,
    pub max_fee_per_gas: Amount,
    pub max_priority_fee_per_gas: Amount,
    pub paymaster_and_data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl UserOperation {
    pub fn new(sender: Address, nonce: u64, call_data: Vec<u8>) -> Self {
        Self {
            sender,
            nonce,
            init_code: Vec::new(),
            call_data,
            call_gas_limit: 0,
            verification_gas_limit: 0,
            pre_verification_gas: 0,
            max_fee_per_gas: 0,
            max_priority_fee_per_gas: 0,
            paymaster_and_data: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Digest signed by the owner or a session key. Binds the operation
    /// (signature excluded) to the entry point and chain.
    pub fn hash(&self, entry_point: &Address, chain_id: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.to_canonical_bytes());
        hasher.update(entry_point.0);
        hasher.update(chain_id.to_le_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

impl CanonicalSerialize for UserOperation {
    fn canonical_serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.sender.canonical_serialize(writer)?;
        self.nonce.canonical_serialize(writer)?;
        self.init_code.canonical_serialize(writer)?;
        self.call_data.canonical_serialize(writer)?;
        self.call_gas_limit.canonical_serialize(writer)?;
        self.verification_gas_limit.canonical_serialize(writer)?;
        self.pre_verification_gas.canonical_serialize(writer)?;
        self.max_fee_per_gas.canonical_serialize(writer)?;
        self.max_priority_fee_per_gas.canonical_serialize(writer)?;
        self.paymaster_and_data.canonical_serialize(writer)
    }
}

/// Outcome of authentication. A failed signature is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationData {
    pub sig_failed: bool,
    pub valid_after: Timestamp,
    /// Zero means no upper bound.
    pub valid_until: Timestamp,
}

impl ValidationData {
    pub fn valid() -> Self {
        Self { sig_failed: false, valid_after: 0, valid_until: 0 }
    }

    pub fn valid_until(expiry: Timestamp) -> Self {
        Self { sig_failed: false, valid_after: 0, valid_until: expiry }
    }

    pub fn failed() -> Self {
        Self { sig_failed: true, valid_after: 0, valid_until: 0 }
    }

    pub fn is_active_at(&self, now: Timestamp) -> bool {
        now >= self.valid_after && (self.valid_until == 0 || now <= self.valid_until)
    }

    /// 32-byte word: `validAfter` in bytes 0..6, `validUntil` in 6..12
    /// (48-bit big-endian), last byte set when the signature failed.
    pub fn pack(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        let after = self.valid_after.min(MAX_PACKED_TIMESTAMP).to_be_bytes();
        let until = self.valid_until.min(MAX_PACKED_TIMESTAMP).to_be_bytes();
        word[0..6].copy_from_slice(&after[2..8]);
        word[6..12].copy_from_slice(&until[2..8]);
        word[31] = u8::from(self.sig_failed);
        word
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_signature_but_binds_context() {
        let ep = Address::from_label("entry-point");
        let mut op = UserOperation::new(Address::from_label("account"), 0, vec![1, 2, 3]);
        let h = op.hash(&ep, 1);

        op.signature = vec![9; 64];
        assert_eq!(op.hash(&ep, 1), h);
        assert_ne!(op.hash(&ep, 2), h);
        assert_ne!(op.hash(&Address::from_label("other"), 1), h);

        op.nonce = 1;
        assert_ne!(op.hash(&ep, 1), h);
    }

    #[test]
    fn test_pack_layout() {
        let word = ValidationData::valid_until(0x0102_0304).pack();
        assert_eq!(&word[0..6], &[0u8; 6]);
        assert_eq!(&word[6..12], &[0, 0, 1, 2, 3, 4]);
        assert_eq!(word[31], 0);

        assert_eq!(ValidationData::failed().pack()[31], 1);
        let clamped = ValidationData::valid_until(u64::MAX).pack();
        assert_eq!(&clamped[6..12], &[0xff; 6]);
    }

    #[test]
    fn test_validity_window() {
        let v = ValidationData::valid_until(100);
        assert!(v.is_active_at(100));
        assert!(!v.is_active_at(101));
        assert!(ValidationData::valid().is_active_at(u64::MAX));
    }
}
