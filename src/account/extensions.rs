//! Owner-facing administration of the built-in session-key validator and
//! spending-limit module.

use super::{Module, SmartAccount};
use crate::error::AccountError;
use crate::events::AccountEvent;
use crate::ledger::Ledger;
use crate::modules::{SocialRecoveryModule, SpendingLimitModule};
use crate::types::{Address, Amount, AssetId, Selector, Timestamp};
use crate::validators::{SessionKeyError, SessionKeyValidator, Validator};

impl SmartAccount {
    // --- Typed access to installed extensions ---

    pub fn session_keys(&self, id: &Address) -> Result<&SessionKeyValidator, AccountError> {
        match self.validators.get(id) {
            Some(Validator::SessionKeys(v)) => Ok(v),
            Some(other) => Err(AccountError::WrongExtension(*id, other.kind_name())),
            None => Err(AccountError::UnknownValidator(*id)),
        }
    }

    pub(crate) fn session_keys_mut(&mut self, id: &Address) -> Result<&mut SessionKeyValidator, AccountError> {
        match self.validators.get_mut(id) {
            Some(Validator::SessionKeys(v)) => Ok(v),
            Some(other) => Err(AccountError::WrongExtension(*id, other.kind_name())),
            None => Err(AccountError::UnknownValidator(*id)),
        }
    }

    pub fn spending_limits(&self, id: &Address) -> Result<&SpendingLimitModule, AccountError> {
        match self.modules.get(id) {
            Some(Module::SpendingLimit(m)) => Ok(m),
            Some(other) => Err(AccountError::WrongExtension(*id, other.kind_name())),
            None => Err(AccountError::UnknownModule(*id)),
        }
    }

    pub(crate) fn spending_limits_mut(&mut self, id: &Address) -> Result<&mut SpendingLimitModule, AccountError> {
        match self.modules.get_mut(id) {
            Some(Module::SpendingLimit(m)) => Ok(m),
            Some(other) => Err(AccountError::WrongExtension(*id, other.kind_name())),
            None => Err(AccountError::UnknownModule(*id)),
        }
    }

    pub fn social_recovery(&self, id: &Address) -> Result<&SocialRecoveryModule, AccountError> {
        match self.modules.get(id) {
            Some(Module::SocialRecovery(m)) => Ok(m),
            Some(other) => Err(AccountError::WrongExtension(*id, other.kind_name())),
            None => Err(AccountError::UnknownModule(*id)),
        }
    }

    pub(crate) fn social_recovery_mut(&mut self, id: &Address) -> Result<&mut SocialRecoveryModule, AccountError> {
        match self.modules.get_mut(id) {
            Some(Module::SocialRecovery(m)) => Ok(m),
            Some(other) => Err(AccountError::WrongExtension(*id, other.kind_name())),
            None => Err(AccountError::UnknownModule(*id)),
        }
    }

    /// Owner-only change to a session-key validator, emitted under its id.
    fn with_session_keys(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        validator: &Address,
        f: impl FnOnce(&mut SessionKeyValidator, Timestamp) -> Result<AccountEvent, SessionKeyError>,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        let now = ledger.now();
        let event = f(self.session_keys_mut(validator)?, now).map_err(|e| AccountError::session(*validator, e))?;
        ledger.emit(*validator, event);
        Ok(())
    }

    // --- Session keys ---

    pub fn grant_session(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        validator: &Address,
        key: Address,
        expiry: Timestamp,
    ) -> Result<(), AccountError> {
        self.with_session_keys(ledger, caller, validator, |v, now| v.grant(key, expiry, now))
    }

    pub fn revoke_session(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        validator: &Address,
        key: &Address,
    ) -> Result<(), AccountError> {
        self.with_session_keys(ledger, caller, validator, |v, _| v.revoke(key))
    }

    pub fn allow_session_selector(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        validator: &Address,
        key: &Address,
        selector: Selector,
        allowed: bool,
    ) -> Result<(), AccountError> {
        self.with_session_keys(ledger, caller, validator, |v, _| v.allow_selector(key, selector, allowed))
    }

    pub fn set_session_spending_cap(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        validator: &Address,
        key: &Address,
        daily_cap: Amount,
    ) -> Result<(), AccountError> {
        self.with_session_keys(ledger, caller, validator, |v, _| v.set_spending_cap(key, daily_cap))
    }

    pub fn set_session_target_restrictions(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        validator: &Address,
        key: &Address,
        enabled: bool,
    ) -> Result<(), AccountError> {
        self.with_session_keys(ledger, caller, validator, |v, _| v.set_target_restrictions(key, enabled))
    }

    pub fn allow_session_target(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        validator: &Address,
        key: &Address,
        target: Address,
        allowed: bool,
    ) -> Result<(), AccountError> {
        self.with_session_keys(ledger, caller, validator, |v, _| v.allow_target(key, target, allowed))
    }

    // --- Spending limits ---

    pub fn set_spending_limit(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        asset: AssetId,
        cap: Amount,
        decimals: u8,
        normalized: bool,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        let now = ledger.now();
        let event = self.spending_limits_mut(module)?.set_limit(asset, cap, decimals, normalized, now)?;
        ledger.emit(*module, event);
        Ok(())
    }

    pub fn remove_spending_limit(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        asset: &AssetId,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        let event = self.spending_limits_mut(module)?.remove_limit(asset)?;
        ledger.emit(*module, event);
        Ok(())
    }

    pub fn enable_owner_bypass(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        duration: u64,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        let now = ledger.now();
        let event = self.spending_limits_mut(module)?.enable_owner_bypass(duration, now)?;
        ledger.emit(*module, event);
        Ok(())
    }

    pub fn disable_owner_bypass(&mut self, ledger: &mut Ledger, caller: &Address, module: &Address) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        let event = self.spending_limits_mut(module)?.disable_owner_bypass();
        ledger.emit(*module, event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::tests::fixture;
    use crate::calldata::{encode_transfer, TRANSFER_SELECTOR};
    use crate::crypto::KeyPair;
    use crate::error::ErrorKind;
    use crate::types::{Call, NATIVE_ASSET};

    const HOUR: u64 = 3_600;
    const DAY: u64 = 86_400;

    #[test]
    fn test_admin_is_owner_only_and_typed() {
        let mut f = fixture();
        let sessions = Address::from_label("sessions");
        let limits = Address::from_label("limits");
        f.account.add_validator(&mut f.ledger, &f.owner, sessions, SessionKeyValidator::default()).unwrap();
        f.account.add_module(&mut f.ledger, &f.owner, limits, SpendingLimitModule::default()).unwrap();
        let key = Address::from_label("session");
        let mallory = Address::from_label("mallory");
        let expiry = f.ledger.now() + DAY;

        assert_eq!(
            f.account.grant_session(&mut f.ledger, &mallory, &sessions, key, expiry),
            Err(AccountError::NotOwner(mallory))
        );
        assert_eq!(
            f.account.grant_session(&mut f.ledger, &f.owner, &limits, key, expiry),
            Err(AccountError::UnknownValidator(limits))
        );
        assert_eq!(
            f.account.set_spending_limit(&mut f.ledger, &f.owner, &sessions, NATIVE_ASSET, 1, 0, false),
            Err(AccountError::UnknownModule(sessions))
        );

        f.account.grant_session(&mut f.ledger, &f.owner, &sessions, key, expiry).unwrap();
        f.account
            .allow_session_selector(&mut f.ledger, &f.owner, &sessions, &key, *TRANSFER_SELECTOR, true)
            .unwrap();
        let v = f.account.session_keys(&sessions).unwrap();
        assert!(v.is_selector_allowed(&key, *TRANSFER_SELECTOR));
        assert_eq!(f.ledger.events_named("SessionGranted").len(), 1);
        assert_eq!(f.ledger.events().last().unwrap().emitter, sessions);
    }

    #[test]
    fn test_owner_bypass_scenario() {
        let mut f = fixture();
        let limits = Address::from_label("limits");
        let bob = Address::from_label("bob");
        f.account.add_module(&mut f.ledger, &f.owner, limits, SpendingLimitModule::default()).unwrap();
        f.account.set_spending_limit(&mut f.ledger, &f.owner, &limits, f.usdc, 100, 0, false).unwrap();
        let big = Call::new(f.usdc, 0, encode_transfer(&bob, 500));

        f.account.enable_owner_bypass(&mut f.ledger, &f.owner, &limits, HOUR).unwrap();
        f.account.execute(&mut f.ledger, &f.owner, &big).unwrap();
        assert_eq!(
            f.ledger.events_named("SpendingLimitBypassed"),
            vec![&AccountEvent::SpendingLimitBypassed { asset: f.usdc, amount: 500 }]
        );
        assert_eq!(f.account.spending_limits(&limits).unwrap().limit(&f.usdc).unwrap().spent, 0);

        f.ledger.advance(HOUR);
        let err = f.account.execute(&mut f.ledger, &f.owner, &big).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExceeded);
        assert_eq!(
            f.ledger.events_named("SpendingLimitExceeded"),
            vec![&AccountEvent::SpendingLimitExceeded { asset: f.usdc, amount: 500, spent: 0, cap: 100 }]
        );
        assert_eq!(f.ledger.balance_of(&bob, &f.usdc), 500);
    }

    #[test]
    fn test_bypass_is_owner_only_and_bounded() {
        let mut f = fixture();
        let limits = Address::from_label("limits");
        let relay = Address::from_label("relay");
        let bob = Address::from_label("bob");
        f.account.add_module(&mut f.ledger, &f.owner, limits, SpendingLimitModule::default()).unwrap();
        f.account.set_delegate(&mut f.ledger, &f.owner, relay).unwrap();
        f.account
            .set_spending_limit(&mut f.ledger, &f.owner, &limits, NATIVE_ASSET, 10, 0, false)
            .unwrap();

        assert!(matches!(
            f.account.enable_owner_bypass(&mut f.ledger, &f.owner, &limits, DAY + 1),
            Err(AccountError::SpendingLimit(_))
        ));
        f.account.enable_owner_bypass(&mut f.ledger, &f.owner, &limits, HOUR).unwrap();

        // The delegate does not inherit the owner's bypass
        assert!(matches!(
            f.account.execute(&mut f.ledger, &relay, &Call::transfer_native(bob, 50)),
            Err(AccountError::LimitExceeded { .. })
        ));

        f.account.disable_owner_bypass(&mut f.ledger, &f.owner, &limits).unwrap();
        assert!(matches!(
            f.account.execute(&mut f.ledger, &f.owner, &Call::transfer_native(bob, 50)),
            Err(AccountError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn test_racing_spends_resolve_in_either_order() {
        for (first, second) in [(30, 80), (80, 30)] {
            let mut f = fixture();
            let limits = Address::from_label("limits");
            f.account.add_module(&mut f.ledger, &f.owner, limits, SpendingLimitModule::default()).unwrap();
            f.account
                .set_spending_limit(&mut f.ledger, &f.owner, &limits, NATIVE_ASSET, 100, 0, false)
                .unwrap();

            let bob = Address::from_label("bob");
            let carol = Address::from_label("carol");
            assert!(f.account.execute(&mut f.ledger, &f.owner, &Call::transfer_native(bob, first)).is_ok());
            assert_eq!(
                f.account.execute(&mut f.ledger, &f.owner, &Call::transfer_native(carol, second)),
                Err(AccountError::LimitExceeded { module: limits, asset: NATIVE_ASSET, amount: second, spent: first, cap: 100 })
            );
            assert_eq!(f.account.spending_limits(&limits).unwrap().limit(&NATIVE_ASSET).unwrap().spent, first);
            assert_eq!(f.ledger.native_balance(&bob), first);
            assert_eq!(f.ledger.native_balance(&carol), 0);
        }
    }

    #[test]
    fn test_racing_session_spends_resolve_in_either_order() {
        for (first, second) in [(30, 80), (80, 30)] {
            let mut f = fixture();
            let sessions = Address::from_label("sessions");
            let key = KeyPair::from_seed([9u8; 32]).address();
            f.account.add_validator(&mut f.ledger, &f.owner, sessions, SessionKeyValidator::default()).unwrap();
            let expiry = f.ledger.now() + DAY;
            f.account.grant_session(&mut f.ledger, &f.owner, &sessions, key, expiry).unwrap();
            f.account
                .allow_session_selector(&mut f.ledger, &f.owner, &sessions, &key, Selector::EMPTY, true)
                .unwrap();
            f.account.set_session_spending_cap(&mut f.ledger, &f.owner, &sessions, &key, 100).unwrap();

            let bob = Address::from_label("bob");
            let first_call = [Call::transfer_native(bob, first)];
            let second_call = [Call::transfer_native(bob, second)];
            assert!(f
                .account
                .execute_as_session(&mut f.ledger, &f.owner, &sessions, &key, &first_call)
                .is_ok());
            let err = f
                .account
                .execute_as_session(&mut f.ledger, &f.owner, &sessions, &key, &second_call)
                .unwrap_err();
            assert!(matches!(
                err,
                AccountError::Session { source: SessionKeyError::CapExceeded { spent, .. }, .. } if spent == first
            ));
            let now = f.ledger.now();
            assert_eq!(f.account.session_keys(&sessions).unwrap().spent_in_window(&key, now), first);
            assert_eq!(f.ledger.native_balance(&bob), first);
        }
    }

    #[test]
    fn test_batch_native_precheck() {
        let mut f = fixture();
        let limits = Address::from_label("limits");
        f.account.add_module(&mut f.ledger, &f.owner, limits, SpendingLimitModule::default()).unwrap();
        f.account
            .set_spending_limit(&mut f.ledger, &f.owner, &limits, NATIVE_ASSET, 100, 0, false)
            .unwrap();
        let bob = Address::from_label("bob");

        let calls = vec![Call::transfer_native(bob, 60), Call::transfer_native(bob, 60)];
        assert_eq!(
            f.account.execute_batch(&mut f.ledger, &f.owner, &calls),
            Err(AccountError::LimitExceeded { module: limits, asset: NATIVE_ASSET, amount: 120, spent: 0, cap: 100 })
        );
        assert_eq!(f.ledger.native_balance(&bob), 0);
    }

    #[test]
    fn test_session_key_admin_errors_are_wrapped() {
        let mut f = fixture();
        let sessions = Address::from_label("sessions");
        f.account.add_validator(&mut f.ledger, &f.owner, sessions, SessionKeyValidator::default()).unwrap();
        let key = KeyPair::from_seed([9u8; 32]).address();

        let err = f
            .account
            .set_session_spending_cap(&mut f.ledger, &f.owner, &sessions, &key, 5)
            .unwrap_err();
        assert_eq!(err, AccountError::session(sessions, SessionKeyError::UnknownKey(key)));
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }
}
