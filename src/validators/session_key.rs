//! Session keys: delegated, time-bounded signing keys scoped by selector,
//! destination and a rolling-window spending cap.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::SignatureValidator;
use crate::config::SessionConfig;
use crate::crypto::{verify_digest, SIGNATURE_LEN};
use crate::error::ErrorKind;
use crate::events::AccountEvent;
use crate::types::{window_id, Address, Amount, Selector, Timestamp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionKeyError {
    #[error("session key must not be the zero identity")]
    ZeroKey,
    #[error("expiry {expiry} is before the earliest allowed {earliest}")]
    ExpiryTooSoon { expiry: Timestamp, earliest: Timestamp },
    #[error("unknown session key {0}")]
    UnknownKey(Address),
    #[error("session key {key} expired at {expiry}")]
    Expired { key: Address, expiry: Timestamp },
    #[error("selector {selector} not allowed for session key {key}")]
    SelectorNotAllowed { key: Address, selector: Selector },
    #[error("target {target} not allowed for session key {key}")]
    TargetNotAllowed { key: Address, target: Address },
    #[error("session key {key} cap exceeded in window {window}: {amount} requested, {spent} of {cap} spent")]
    CapExceeded {
        key: Address,
        amount: Amount,
        spent: Amount,
        cap: Amount,
        window: u64,
    },
}

impl SessionKeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionKeyError::ZeroKey | SessionKeyError::ExpiryTooSoon { .. } => ErrorKind::StateConsistency,
            SessionKeyError::UnknownKey(_)
            | SessionKeyError::Expired { .. }
            | SessionKeyError::SelectorNotAllowed { .. }
            | SessionKeyError::TargetNotAllowed { .. } => ErrorKind::Authorization,
            SessionKeyError::CapExceeded { .. } => ErrorKind::ResourceExceeded,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub expiry: Timestamp,
    pub selectors: BTreeSet<Selector>,
    /// Zero means unlimited.
    pub daily_cap: Amount,
    pub target_restricted: bool,
    pub targets: BTreeSet<Address>,
    /// Spent per window id.
    spent: BTreeMap<u64, Amount>,
}

impl SessionKey {
    fn new(expiry: Timestamp) -> Self {
        Self {
            expiry,
            selectors: BTreeSet::new(),
            daily_cap: 0,
            target_restricted: false,
            targets: BTreeSet::new(),
            spent: BTreeMap::new(),
        }
    }

    pub fn spent_in(&self, window: u64) -> Amount {
        self.spent.get(&window).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct SessionKeyValidator {
    keys: BTreeMap<Address, SessionKey>,
    window_secs: u64,
    min_expiry_buffer_secs: u64,
}

impl Default for SessionKeyValidator {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

impl SessionKeyValidator {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            keys: BTreeMap::new(),
            window_secs: config.window_secs,
            min_expiry_buffer_secs: config.min_expiry_buffer_secs,
        }
    }

    pub fn session(&self, key: &Address) -> Option<&SessionKey> {
        self.keys.get(key)
    }

    // --- Administration (owner-only, enforced by the account) ---

    /// Grant `key` until `expiry`. Re-granting an existing key moves its
    /// expiry and keeps its restrictions and spend history.
    pub fn grant(&mut self, key: Address, expiry: Timestamp, now: Timestamp) -> Result<AccountEvent, SessionKeyError> {
        if key.is_zero() {
            return Err(SessionKeyError::ZeroKey);
        }
        let earliest = now.saturating_add(self.min_expiry_buffer_secs);
        if expiry < earliest {
            return Err(SessionKeyError::ExpiryTooSoon { expiry, earliest });
        }

        self.keys
            .entry(key)
            .and_modify(|s| s.expiry = expiry)
            .or_insert_with(|| SessionKey::new(expiry));
        info!(key = ?key, expiry, "session key granted");
        Ok(AccountEvent::SessionGranted { key, expiry })
    }

    pub fn revoke(&mut self, key: &Address) -> Result<AccountEvent, SessionKeyError> {
        self.keys.remove(key).ok_or(SessionKeyError::UnknownKey(*key))?;
        info!(key = ?key, "session key revoked");
        Ok(AccountEvent::SessionRevoked { key: *key })
    }

    pub fn allow_selector(
        &mut self,
        key: &Address,
        selector: Selector,
        allowed: bool,
    ) -> Result<AccountEvent, SessionKeyError> {
        let session = self.session_mut(key)?;
        if allowed {
            session.selectors.insert(selector);
        } else {
            session.selectors.remove(&selector);
        }
        Ok(AccountEvent::SelectorAllowanceChanged { key: *key, selector, allowed })
    }

    pub fn set_spending_cap(&mut self, key: &Address, daily_cap: Amount) -> Result<AccountEvent, SessionKeyError> {
        self.session_mut(key)?.daily_cap = daily_cap;
        Ok(AccountEvent::SessionCapSet { key: *key, daily_cap })
    }

    pub fn set_target_restrictions(&mut self, key: &Address, enabled: bool) -> Result<AccountEvent, SessionKeyError> {
        self.session_mut(key)?.target_restricted = enabled;
        Ok(AccountEvent::TargetRestrictionChanged { key: *key, enabled })
    }

    pub fn allow_target(
        &mut self,
        key: &Address,
        target: Address,
        allowed: bool,
    ) -> Result<AccountEvent, SessionKeyError> {
        let session = self.session_mut(key)?;
        if allowed {
            session.targets.insert(target);
        } else {
            session.targets.remove(&target);
        }
        Ok(AccountEvent::TargetAllowanceChanged { key: *key, target, allowed })
    }

    fn session_mut(&mut self, key: &Address) -> Result<&mut SessionKey, SessionKeyError> {
        self.keys.get_mut(key).ok_or(SessionKeyError::UnknownKey(*key))
    }

    // --- Pure queries ---

    /// A truncated selector is never allowed.
    pub fn is_selector_allowed(&self, key: &Address, selector: Selector) -> bool {
        selector != Selector::Truncated && self.keys.get(key).is_some_and(|s| s.selectors.contains(&selector))
    }

    /// Unknown keys are never allowed; without restrictions every target is.
    pub fn is_target_allowed(&self, key: &Address, target: &Address) -> bool {
        match self.keys.get(key) {
            Some(s) => !s.target_restricted || s.targets.contains(target),
            None => false,
        }
    }

    pub fn would_exceed_cap(&self, key: &Address, amount: Amount, timestamp: Timestamp) -> bool {
        let Some(session) = self.keys.get(key) else {
            return true;
        };
        if session.daily_cap == 0 {
            return false;
        }
        let spent = session.spent_in(window_id(timestamp, self.window_secs));
        match spent.checked_add(amount) {
            Some(total) => total > session.daily_cap,
            None => true,
        }
    }

    pub fn spent_in_window(&self, key: &Address, timestamp: Timestamp) -> Amount {
        self.keys
            .get(key)
            .map(|s| s.spent_in(window_id(timestamp, self.window_secs)))
            .unwrap_or(0)
    }

    // --- Execution phase ---

    /// Check and record `amount` against the key's cap for the window of
    /// `timestamp`, or fail without changing anything.
    pub fn consume_or_revert(
        &mut self,
        key: &Address,
        amount: Amount,
        timestamp: Timestamp,
    ) -> Result<AccountEvent, SessionKeyError> {
        let window = window_id(timestamp, self.window_secs);
        let session = self.session_mut(key)?;
        if timestamp > session.expiry {
            return Err(SessionKeyError::Expired { key: *key, expiry: session.expiry });
        }

        let spent = session.spent_in(window);
        let cap = session.daily_cap;
        let total = spent.checked_add(amount).filter(|t| cap == 0 || *t <= cap);
        let Some(total) = total else {
            warn!(key = ?key, amount, spent, cap, window, "session cap exceeded");
            return Err(SessionKeyError::CapExceeded { key: *key, amount, spent, cap, window });
        };

        session.spent.retain(|w, _| *w >= window);
        session.spent.insert(window, total);
        debug!(key = ?key, amount, window, spent = total, "session spend recorded");
        Ok(AccountEvent::CapConsumed { key: *key, amount, window, spent: total })
    }

    // --- Signatures ---

    /// Session key that produced `signature` over `digest`, if it is granted.
    /// Wire form: key (32 bytes) followed by the ed25519 signature.
    pub fn signer_of(&self, signature: &[u8], digest: &[u8; 32]) -> Option<Address> {
        if signature.len() != 32 + SIGNATURE_LEN {
            return None;
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&signature[..32]);
        let key = Address(raw);
        if !self.keys.contains_key(&key) {
            return None;
        }
        verify_digest(&key, digest, &signature[32..]).then_some(key)
    }
}

impl SignatureValidator for SessionKeyValidator {
    fn is_valid_user_op(&self, signature: &[u8], digest: &[u8; 32]) -> bool {
        self.signer_of(signature, digest).is_some()
    }

    fn is_valid_signature(&self, signature: &[u8], digest: &[u8; 32], now: Timestamp) -> bool {
        self.signer_of(signature, digest)
            .and_then(|key| self.keys.get(&key))
            .is_some_and(|s| now <= s.expiry)
    }

    fn clone_box(&self) -> Box<dyn SignatureValidator> {
        Box::new(self.clone())
    }
}
