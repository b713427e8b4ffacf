//! Alternative signature authorities consulted when the owner check fails.

pub mod session_key;

use std::fmt;

use crate::types::Timestamp;

pub use session_key::{SessionKey, SessionKeyError, SessionKeyValidator};

/// Authentication extension. Checks are pure: no state changes, and the
/// operation path never reads the clock.
pub trait SignatureValidator {
    /// Accept a signature over an operation digest.
    fn is_valid_user_op(&self, signature: &[u8], digest: &[u8; 32]) -> bool;

    /// Accept a signature over an arbitrary digest at time `now`.
    fn is_valid_signature(&self, signature: &[u8], digest: &[u8; 32], now: Timestamp) -> bool;

    fn clone_box(&self) -> Box<dyn SignatureValidator>;
}

pub enum Validator {
    SessionKeys(SessionKeyValidator),
    Custom(Box<dyn SignatureValidator>),
}

impl Validator {
    pub fn as_validator(&self) -> &dyn SignatureValidator {
        match self {
            Validator::SessionKeys(v) => v,
            Validator::Custom(v) => v.as_ref(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Validator::SessionKeys(_) => "session key validator",
            Validator::Custom(_) => "custom validator",
        }
    }
}

impl Clone for Validator {
    fn clone(&self) -> Self {
        match self {
            Validator::SessionKeys(v) => Validator::SessionKeys(v.clone()),
            Validator::Custom(v) => Validator::Custom(v.clone_box()),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::SessionKeys(v) => f.debug_tuple("SessionKeys").field(v).finish(),
            Validator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<SessionKeyValidator> for Validator {
    fn from(v: SessionKeyValidator) -> Self {
        Validator::SessionKeys(v)
    }
}
