//! Signature authority: owner key first, then each registered validator.

use tracing::debug;

use super::user_op::{UserOperation, ValidationData, ERC1271_INVALID, ERC1271_MAGIC_VALUE};
use super::SmartAccount;
use crate::calldata::AccountCall;
use crate::crypto::verify_digest;
use crate::error::AccountError;
use crate::ledger::Ledger;
use crate::types::{Address, Amount};
use crate::validators::{SessionKeyValidator, Validator};

impl SmartAccount {
    /// Authenticate an operation delivered by the delegate.
    ///
    /// Takes `&self` and no host handle: authentication never mutates state
    /// and never reads the clock. A bad signature is reported through
    /// [`ValidationData::sig_failed`]; errors are reserved for callers that
    /// may not ask at all.
    pub fn validate_user_op(
        &self,
        caller: &Address,
        op: &UserOperation,
        digest: &[u8; 32],
        required_top_up: Amount,
    ) -> Result<ValidationData, AccountError> {
        if Some(*caller) != self.delegate {
            return Err(AccountError::NotDelegate(*caller));
        }
        // Deposits are pre-funded; a requested top-up is refused outright
        if required_top_up != 0 {
            return Err(AccountError::TopUpRequired(required_top_up));
        }
        if op.sender != self.address {
            return Ok(ValidationData::failed());
        }

        if verify_digest(&self.owner, digest, &op.signature) {
            return Ok(ValidationData::valid());
        }

        for (id, validator) in self.validators.iter() {
            match validator {
                Validator::SessionKeys(sessions) => {
                    if let Some(key) = sessions.signer_of(&op.signature, digest) {
                        return Ok(session_scope(id, sessions, &key, &op.call_data));
                    }
                }
                Validator::Custom(v) => {
                    if v.is_valid_user_op(&op.signature, digest) {
                        debug!(validator = ?id, "operation accepted by custom validator");
                        return Ok(ValidationData::valid());
                    }
                }
            }
        }
        Ok(ValidationData::failed())
    }

    /// Signature check for arbitrary digests. Returns the accepted or
    /// rejected reply word.
    pub fn is_valid_signature(&self, ledger: &Ledger, digest: &[u8; 32], signature: &[u8]) -> [u8; 4] {
        if verify_digest(&self.owner, digest, signature) {
            return ERC1271_MAGIC_VALUE;
        }
        let now = ledger.now();
        let accepted = self
            .validators
            .iter()
            .any(|(_, v)| v.as_validator().is_valid_signature(signature, digest, now));
        if accepted {
            ERC1271_MAGIC_VALUE
        } else {
            ERC1271_INVALID
        }
    }
}

/// A session key may only sign `executeAsSession` naming itself and this
/// validator, with every call inside its selector and target scope. The
/// key's expiry bounds the operation's validity window.
fn session_scope(validator: &Address, sessions: &SessionKeyValidator, key: &Address, call_data: &[u8]) -> ValidationData {
    let Some(session) = sessions.session(key) else {
        return ValidationData::failed();
    };
    let calls = match AccountCall::decode(call_data) {
        Ok(AccountCall::ExecuteAsSession { validator: v, session_key, calls })
            if v == *validator && session_key == *key && !calls.is_empty() =>
        {
            calls
        }
        _ => {
            debug!(key = ?key, "session key signed call data outside executeAsSession");
            return ValidationData::failed();
        }
    };

    let in_scope = calls.iter().all(|call| {
        sessions.is_selector_allowed(key, call.selector()) && sessions.is_target_allowed(key, &call.target)
    });
    if !in_scope {
        debug!(key = ?key, "session call outside allowed scope");
        return ValidationData::failed();
    }
    ValidationData::valid_until(session.expiry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::tests::{fixture, Fixture};
    use crate::calldata::{encode_transfer, TRANSFER_SELECTOR};
    use crate::crypto::KeyPair;
    use crate::types::Call;

    const DAY: u64 = 86_400;

    struct Setup {
        f: Fixture,
        owner_key: KeyPair,
        session: KeyPair,
        sessions: Address,
        relay: Address,
    }

    fn setup() -> Setup {
        let base = fixture();
        let owner_key = KeyPair::from_seed([1u8; 32]);
        let mut account = SmartAccount::new(base.account.address(), owner_key.address()).unwrap();
        let mut ledger = base.ledger;
        let owner = owner_key.address();
        let relay = ledger.entry_point();
        let sessions = Address::from_label("sessions");
        let session = KeyPair::from_seed([2u8; 32]);

        account.set_delegate(&mut ledger, &owner, relay).unwrap();
        account
            .add_validator(&mut ledger, &owner, sessions, SessionKeyValidator::default())
            .unwrap();
        let expiry = ledger.now() + DAY;
        account.grant_session(&mut ledger, &owner, &sessions, session.address(), expiry).unwrap();
        account
            .allow_session_selector(&mut ledger, &owner, &sessions, &session.address(), *TRANSFER_SELECTOR, true)
            .unwrap();

        let f = Fixture { ledger, account, owner, usdc: base.usdc };
        Setup { f, owner_key, session, sessions, relay }
    }

    fn session_op(s: &Setup, calls: Vec<Call>) -> UserOperation {
        let call_data = AccountCall::ExecuteAsSession {
            validator: s.sessions,
            session_key: s.session.address(),
            calls,
        }
        .encode();
        UserOperation::new(s.f.account.address(), 0, call_data)
    }

    #[test]
    fn test_owner_signature_and_caller_rules() {
        let s = setup();
        let call = Call::transfer_native(Address::from_label("bob"), 1);
        let mut op = UserOperation::new(s.f.account.address(), 0, AccountCall::Execute(call).encode());
        let digest = s.f.ledger.user_op_hash(&op);
        op.signature = s.owner_key.sign_digest(&digest);

        assert_eq!(s.f.account.validate_user_op(&s.relay, &op, &digest, 0), Ok(ValidationData::valid()));
        assert_eq!(
            s.f.account.validate_user_op(&s.f.owner, &op, &digest, 0),
            Err(AccountError::NotDelegate(s.f.owner))
        );
        assert_eq!(
            s.f.account.validate_user_op(&s.relay, &op, &digest, 1),
            Err(AccountError::TopUpRequired(1))
        );

        let mut foreign = op.clone();
        foreign.sender = Address::from_label("elsewhere");
        assert!(s.f.account.validate_user_op(&s.relay, &foreign, &digest, 0).unwrap().sig_failed);

        op.signature = KeyPair::from_seed([7u8; 32]).sign_digest(&digest);
        assert!(s.f.account.validate_user_op(&s.relay, &op, &digest, 0).unwrap().sig_failed);
    }

    #[test]
    fn test_validation_is_deterministic_and_side_effect_free() {
        let mut s = setup();
        let pay = Call::new(s.f.usdc, 0, encode_transfer(&Address::from_label("bob"), 5));
        let mut op = session_op(&s, vec![pay]);
        let digest = s.f.ledger.user_op_hash(&op);
        op.signature = s.session.sign_digest_as_session(&digest);

        let events_before = s.f.ledger.events().len();
        let first = s.f.account.validate_user_op(&s.relay, &op, &digest, 0).unwrap();
        s.f.ledger.advance(10 * DAY);
        let second = s.f.account.validate_user_op(&s.relay, &op, &digest, 0).unwrap();

        assert_eq!(first, second);
        assert!(!first.sig_failed);
        assert_eq!(first.valid_until, s.f.account.session_keys(&s.sessions).unwrap().session(&s.session.address()).unwrap().expiry);
        assert_eq!(s.f.ledger.events().len(), events_before);
    }

    #[test]
    fn test_session_scope_containment() {
        let s = setup();
        let bob = Address::from_label("bob");

        // Selector outside the allowlist
        let mut op = session_op(&s, vec![Call::new(s.f.usdc, 0, vec![0xde, 0xad, 0xbe, 0xef])]);
        let digest = s.f.ledger.user_op_hash(&op);
        op.signature = s.session.sign_digest_as_session(&digest);
        assert!(s.f.account.validate_user_op(&s.relay, &op, &digest, 0).unwrap().sig_failed);

        // Session signature on plain execute call data
        let pay = Call::new(s.f.usdc, 0, encode_transfer(&bob, 5));
        let mut op = UserOperation::new(s.f.account.address(), 0, AccountCall::Execute(pay.clone()).encode());
        let digest = s.f.ledger.user_op_hash(&op);
        op.signature = s.session.sign_digest_as_session(&digest);
        assert!(s.f.account.validate_user_op(&s.relay, &op, &digest, 0).unwrap().sig_failed);

        // Naming a different key than the signer
        let call_data = AccountCall::ExecuteAsSession {
            validator: s.sessions,
            session_key: Address::from_label("other-key"),
            calls: vec![pay],
        }
        .encode();
        let mut op = UserOperation::new(s.f.account.address(), 0, call_data);
        let digest = s.f.ledger.user_op_hash(&op);
        op.signature = s.session.sign_digest_as_session(&digest);
        assert!(s.f.account.validate_user_op(&s.relay, &op, &digest, 0).unwrap().sig_failed);
    }

    #[test]
    fn test_is_valid_signature_replies() {
        let mut s = setup();
        let digest = [4u8; 32];
        assert_eq!(
            s.f.account.is_valid_signature(&s.f.ledger, &digest, &s.owner_key.sign_digest(&digest)),
            ERC1271_MAGIC_VALUE
        );
        let session_sig = s.session.sign_digest_as_session(&digest);
        assert_eq!(s.f.account.is_valid_signature(&s.f.ledger, &digest, &session_sig), ERC1271_MAGIC_VALUE);
        assert_eq!(s.f.account.is_valid_signature(&s.f.ledger, &digest, &[0u8; 64]), ERC1271_INVALID);

        s.f.ledger.advance(DAY + 1);
        assert_eq!(s.f.account.is_valid_signature(&s.f.ledger, &digest, &session_sig), ERC1271_INVALID);
    }
}
