//! The smart account: owner authority, installed extensions and the
//! execution pipeline.
//!
//! Every mutating entry point runs atomically: on error the account and the
//! host are restored to their state before the call, and rejections that
//! carry an audit event have it appended afterwards.

pub mod auth;
pub mod extensions;
pub mod hooks;
pub mod recovery;
pub mod registry;
pub mod user_op;

use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::error::AccountError;
use crate::events::AccountEvent;
use crate::ledger::Ledger;
use crate::types::{Address, Amount, Call};
use crate::validators::Validator;

pub use hooks::{BatchCheck, Denial, HookCall, HookEnv, HookModule, HookVerdict, Module};
pub use registry::{Registry, RegistryError};
pub use user_op::{UserOperation, ValidationData, ERC1271_INVALID, ERC1271_MAGIC_VALUE};

#[derive(Debug, Clone)]
pub struct SmartAccount {
    address: Address,
    owner: Address,
    delegate: Option<Address>,
    /// Non-zero while hooks run.
    depth: u32,
    modules: Registry<Module>,
    validators: Registry<Validator>,
    recovery_modules: BTreeSet<Address>,
}

impl SmartAccount {
    pub fn new(address: Address, owner: Address) -> Result<Self, AccountError> {
        if address.is_zero() || owner.is_zero() {
            return Err(AccountError::ZeroAddress);
        }
        Ok(Self {
            address,
            owner,
            delegate: None,
            depth: 0,
            modules: Registry::new(),
            validators: Registry::new(),
            recovery_modules: BTreeSet::new(),
        })
    }

    // --- Views ---

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn delegate(&self) -> Option<Address> {
        self.delegate
    }

    pub fn modules(&self) -> &Registry<Module> {
        &self.modules
    }

    pub fn validators(&self) -> &Registry<Validator> {
        &self.validators
    }

    pub fn is_recovery_module(&self, module: &Address) -> bool {
        self.recovery_modules.contains(module)
    }

    // --- Guards ---

    fn ensure_owner(&self, caller: &Address) -> Result<(), AccountError> {
        if *caller != self.owner {
            return Err(AccountError::NotOwner(*caller));
        }
        Ok(())
    }

    fn ensure_executor(&self, caller: &Address) -> Result<(), AccountError> {
        if *caller != self.owner && Some(*caller) != self.delegate {
            return Err(AccountError::NotExecutor(*caller));
        }
        Ok(())
    }

    fn ensure_not_entered(&self) -> Result<(), AccountError> {
        if self.depth != 0 {
            return Err(AccountError::Reentrancy);
        }
        Ok(())
    }

    /// Run `f` all-or-nothing against the account and the host.
    fn atomically<T>(
        &mut self,
        ledger: &mut Ledger,
        f: impl FnOnce(&mut Self, &mut Ledger) -> Result<T, AccountError>,
    ) -> Result<T, AccountError> {
        let saved = self.clone();
        let checkpoint = ledger.checkpoint();
        match f(self, ledger) {
            Ok(value) => Ok(value),
            Err(e) => {
                *self = saved;
                ledger.rollback(checkpoint);
                if let Some((emitter, event)) = e.failure_event() {
                    ledger.emit(emitter, event);
                }
                warn!(account = ?self.address, kind = ?e.kind(), error = %e, "operation rejected");
                Err(e)
            }
        }
    }

    // --- Owner administration ---

    pub fn set_delegate(&mut self, ledger: &mut Ledger, caller: &Address, delegate: Address) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        if delegate.is_zero() {
            return Err(AccountError::ZeroAddress);
        }
        let previous = self.delegate.replace(delegate);
        info!(account = ?self.address, delegate = ?delegate, "delegate set");
        ledger.emit(self.address, AccountEvent::DelegateChanged { previous, delegate });
        Ok(())
    }

    pub fn transfer_ownership(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        new_owner: Address,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        self.change_owner(ledger, new_owner, None)
    }

    fn change_owner(
        &mut self,
        ledger: &mut Ledger,
        new_owner: Address,
        via_recovery_module: Option<Address>,
    ) -> Result<(), AccountError> {
        if new_owner.is_zero() {
            return Err(AccountError::ZeroAddress);
        }
        let previous = std::mem::replace(&mut self.owner, new_owner);
        info!(account = ?self.address, previous = ?previous, new_owner = ?new_owner, "owner changed");
        ledger.emit(self.address, AccountEvent::OwnerChanged { previous, new_owner, via_recovery_module });
        Ok(())
    }

    pub fn add_module(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        id: Address,
        module: impl Into<Module>,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        self.ensure_not_entered()?;
        self.modules.add(id, module.into())?;
        info!(account = ?self.address, module = ?id, "module added");
        ledger.emit(self.address, AccountEvent::ModuleAdded { module: id });
        Ok(())
    }

    /// Uninstall a module. It also loses any recovery authorization. A
    /// recovery module cannot be removed while its request is live.
    pub fn remove_module(&mut self, ledger: &mut Ledger, caller: &Address, id: &Address) -> Result<Module, AccountError> {
        self.ensure_owner(caller)?;
        self.ensure_not_entered()?;
        self.ensure_no_live_recovery(id)?;
        let module = self.modules.remove(id)?;
        if self.recovery_modules.remove(id) {
            ledger.emit(
                self.address,
                AccountEvent::RecoveryModuleAuthorizationChanged { module: *id, authorized: false },
            );
        }
        info!(account = ?self.address, module = ?id, "module removed");
        ledger.emit(self.address, AccountEvent::ModuleRemoved { module: *id });
        Ok(module)
    }

    pub fn add_validator(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        id: Address,
        validator: impl Into<Validator>,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        self.validators.add(id, validator.into())?;
        info!(account = ?self.address, validator = ?id, "validator added");
        ledger.emit(self.address, AccountEvent::ValidatorAdded { validator: id });
        Ok(())
    }

    pub fn remove_validator(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        id: &Address,
    ) -> Result<Validator, AccountError> {
        self.ensure_owner(caller)?;
        let validator = self.validators.remove(id)?;
        info!(account = ?self.address, validator = ?id, "validator removed");
        ledger.emit(self.address, AccountEvent::ValidatorRemoved { validator: *id });
        Ok(validator)
    }

    pub fn set_recovery_module_authorization(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        authorized: bool,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        if authorized {
            if !self.modules.contains(module) {
                return Err(AccountError::UnknownModule(*module));
            }
            self.recovery_modules.insert(*module);
        } else {
            self.ensure_no_live_recovery(module)?;
            self.recovery_modules.remove(module);
        }
        ledger.emit(
            self.address,
            AccountEvent::RecoveryModuleAuthorizationChanged { module: *module, authorized },
        );
        Ok(())
    }

    // --- Execution ---

    /// Run one call through pre-hooks, the host and post-hooks.
    pub fn execute(&mut self, ledger: &mut Ledger, caller: &Address, call: &Call) -> Result<Vec<u8>, AccountError> {
        self.atomically(ledger, |account, ledger| {
            account.ensure_not_entered()?;
            account.ensure_executor(caller)?;
            account.run_call(ledger, caller, call)
        })
    }

    /// Run a list of calls as one atomic unit.
    pub fn execute_batch(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        calls: &[Call],
    ) -> Result<Vec<Vec<u8>>, AccountError> {
        self.atomically(ledger, |account, ledger| {
            account.ensure_not_entered()?;
            account.ensure_executor(caller)?;
            account.run_batch(ledger, caller, calls)
        })
    }

    /// Execute calls authorized by a session key. The key's scope is
    /// re-checked and its cap consumed before any value moves.
    pub fn execute_as_session(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        validator: &Address,
        session_key: &Address,
        calls: &[Call],
    ) -> Result<Vec<Vec<u8>>, AccountError> {
        self.atomically(ledger, |account, ledger| {
            account.ensure_not_entered()?;
            account.ensure_executor(caller)?;
            if calls.is_empty() {
                return Err(AccountError::EmptyBatch);
            }
            let total = total_value(calls)?;
            let now = ledger.now();

            let session = account.session_keys_mut(validator)?;
            for call in calls {
                if !session.is_target_allowed(session_key, &call.target) {
                    return Err(AccountError::session(
                        *validator,
                        crate::validators::SessionKeyError::TargetNotAllowed {
                            key: *session_key,
                            target: call.target,
                        },
                    ));
                }
                let selector = call.selector();
                if !session.is_selector_allowed(session_key, selector) {
                    return Err(AccountError::session(
                        *validator,
                        crate::validators::SessionKeyError::SelectorNotAllowed { key: *session_key, selector },
                    ));
                }
            }
            let consumed = session
                .consume_or_revert(session_key, total, now)
                .map_err(|e| AccountError::session(*validator, e))?;
            ledger.emit(*validator, consumed);

            account.run_batch(ledger, caller, calls)
        })
    }

    fn run_batch(&mut self, ledger: &mut Ledger, caller: &Address, calls: &[Call]) -> Result<Vec<Vec<u8>>, AccountError> {
        if calls.is_empty() {
            return Err(AccountError::EmptyBatch);
        }
        if calls.iter().any(|c| c.target.is_zero()) {
            return Err(AccountError::ZeroTarget);
        }
        let check = BatchCheck {
            caller: *caller,
            owner: self.owner,
            calls,
            total_native: total_value(calls)?,
            now: ledger.now(),
        };
        self.depth = 1;
        self.run_batch_checks(ledger, &check)?;
        self.depth = 0;

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.run_call(ledger, caller, call)?);
        }
        Ok(results)
    }

    fn run_call(&mut self, ledger: &mut Ledger, caller: &Address, call: &Call) -> Result<Vec<u8>, AccountError> {
        if call.target.is_zero() {
            return Err(AccountError::ZeroTarget);
        }
        let hook_call = HookCall {
            caller: *caller,
            owner: self.owner,
            account: self.address,
            target: call.target,
            value: call.value,
            payload: &call.payload,
            now: ledger.now(),
        };

        self.depth = 1;
        self.run_pre_hooks(ledger, &hook_call)?;
        self.depth = 0;

        let result = ledger.call(&self.address, call)?;

        self.depth = 1;
        self.run_post_hooks(ledger, &hook_call, &result);
        self.depth = 0;

        debug!(account = ?self.address, target = ?call.target, value = call.value, "call executed");
        ledger.emit(
            self.address,
            AccountEvent::Executed {
                caller: *caller,
                target: call.target,
                value: call.value,
                selector: call.selector(),
            },
        );
        Ok(result)
    }

    // Modules are taken out of the registry while they run so each can get
    // `&mut` access alongside a `HookEnv` over the account.

    fn run_pre_hooks(&mut self, ledger: &mut Ledger, call: &HookCall<'_>) -> Result<(), AccountError> {
        let mut modules = std::mem::take(&mut self.modules);
        let mut outcome = Ok(());
        for (id, module) in modules.iter_mut() {
            let mut env = HookEnv::new(self, ledger, *id);
            if let HookVerdict::Deny(denial) = module.hook_mut().pre_hook(&mut env, call) {
                outcome = Err(denial.into_error(*id));
                break;
            }
        }
        self.modules = modules;
        outcome
    }

    fn run_post_hooks(&mut self, ledger: &mut Ledger, call: &HookCall<'_>, result: &[u8]) {
        let mut modules = std::mem::take(&mut self.modules);
        for (id, module) in modules.iter_mut() {
            let mut env = HookEnv::new(self, ledger, *id);
            if let HookVerdict::Deny(denial) = module.hook_mut().post_hook(&mut env, call, result) {
                warn!(module = ?id, target = ?call.target, reason = %denial, "post-hook denied");
                ledger.emit(
                    self.address,
                    AccountEvent::ModulePostHookFailed {
                        module: *id,
                        target: call.target,
                        reason: denial.to_string(),
                    },
                );
            }
        }
        self.modules = modules;
    }

    fn run_batch_checks(&mut self, ledger: &mut Ledger, check: &BatchCheck<'_>) -> Result<(), AccountError> {
        let mut modules = std::mem::take(&mut self.modules);
        let mut outcome = Ok(());
        for (id, module) in modules.iter_mut() {
            let mut env = HookEnv::new(self, ledger, *id);
            match module.hook_mut().batch_pre_check(&mut env, check) {
                Some(HookVerdict::Deny(denial)) => {
                    outcome = Err(denial.into_error(*id));
                    break;
                }
                Some(HookVerdict::Allow) => {}
                None => debug!(module = ?id, "module has no batch check"),
            }
        }
        self.modules = modules;
        outcome
    }
}

fn total_value(calls: &[Call]) -> Result<Amount, AccountError> {
    calls
        .iter()
        .try_fold(0 as Amount, |acc, c| acc.checked_add(c.value))
        .ok_or(AccountError::ValueOverflow)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::calldata::encode_transfer;
    use crate::events::AccountEvent;
    use crate::modules::SpendingLimitModule;
    use crate::types::NATIVE_ASSET;

    pub(crate) struct Fixture {
        pub ledger: Ledger,
        pub account: SmartAccount,
        pub owner: Address,
        pub usdc: Address,
    }

    pub(crate) fn fixture() -> Fixture {
        crate::config::init_test_tracing();
        let mut ledger = Ledger::new(1_000_000);
        let owner = Address::from_label("owner");
        let address = Address::from_label("account");
        let usdc = Address::from_label("usdc");
        ledger.register_token(usdc);
        ledger.mint(&address, &NATIVE_ASSET, 1_000_000).unwrap();
        ledger.mint(&address, &usdc, 1_000_000).unwrap();
        let account = SmartAccount::new(address, owner).unwrap();
        Fixture { ledger, account, owner, usdc }
    }

    /// Hook that denies everything, or calls back into the account.
    #[derive(Clone)]
    struct ProbeHook {
        deny_pre: bool,
        deny_post: bool,
        reenter: bool,
        batch_aware: bool,
    }

    impl ProbeHook {
        fn quiet() -> Self {
            Self { deny_pre: false, deny_post: false, reenter: false, batch_aware: false }
        }
    }

    impl HookModule for ProbeHook {
        fn pre_hook(&mut self, env: &mut HookEnv<'_>, call: &HookCall<'_>) -> HookVerdict {
            if self.reenter {
                let again = Call::transfer_native(call.target, 1);
                return match env.execute(&call.owner, &again) {
                    Err(AccountError::Reentrancy) => HookVerdict::Deny(Denial::Policy("reentered".into())),
                    _ => HookVerdict::Allow,
                };
            }
            if self.deny_pre {
                return HookVerdict::Deny(Denial::Policy("blocked".into()));
            }
            HookVerdict::Allow
        }

        fn post_hook(&mut self, _env: &mut HookEnv<'_>, _call: &HookCall<'_>, _result: &[u8]) -> HookVerdict {
            if self.deny_post {
                return HookVerdict::Deny(Denial::Policy("audit failed".into()));
            }
            HookVerdict::Allow
        }

        fn batch_pre_check(&mut self, _env: &mut HookEnv<'_>, batch: &BatchCheck<'_>) -> Option<HookVerdict> {
            if !self.batch_aware {
                return None;
            }
            if batch.calls.len() > 2 {
                return Some(HookVerdict::Deny(Denial::Policy("batch too long".into())));
            }
            Some(HookVerdict::Allow)
        }

        fn clone_box(&self) -> Box<dyn HookModule> {
            Box::new(self.clone())
        }
    }

    fn install(f: &mut Fixture, label: &str, hook: ProbeHook) -> Address {
        let id = Address::from_label(label);
        f.account
            .add_module(&mut f.ledger, &f.owner, id, Module::Custom(Box::new(hook)))
            .unwrap();
        id
    }

    #[test]
    fn test_owner_and_delegate_may_execute() {
        let mut f = fixture();
        let bob = Address::from_label("bob");
        let relay = Address::from_label("relay");

        f.account.execute(&mut f.ledger, &f.owner, &Call::transfer_native(bob, 10)).unwrap();
        assert_eq!(
            f.account.execute(&mut f.ledger, &relay, &Call::transfer_native(bob, 10)),
            Err(AccountError::NotExecutor(relay))
        );

        f.account.set_delegate(&mut f.ledger, &f.owner, relay).unwrap();
        f.account.execute(&mut f.ledger, &relay, &Call::transfer_native(bob, 10)).unwrap();
        assert_eq!(f.ledger.native_balance(&bob), 20);
        assert_eq!(f.ledger.events_named("Executed").len(), 2);
    }

    #[test]
    fn test_zero_target_rejected() {
        let mut f = fixture();
        let before = f.ledger.events().len();
        assert_eq!(
            f.account.execute(&mut f.ledger, &f.owner, &Call::transfer_native(Address::ZERO, 1)),
            Err(AccountError::ZeroTarget)
        );
        assert_eq!(f.ledger.events().len(), before);
        assert_eq!(f.ledger.native_balance(&f.account.address()), 1_000_000);
    }

    #[test]
    fn test_pre_hook_veto_rolls_back_everything() {
        let mut f = fixture();
        let limits = Address::from_label("limits");
        let mut limit = SpendingLimitModule::default();
        limit.set_limit(f.usdc, 1_000, 0, false, f.ledger.now()).unwrap();
        f.account.add_module(&mut f.ledger, &f.owner, limits, limit).unwrap();
        let blocker = install(&mut f, "blocker", ProbeHook { deny_pre: true, ..ProbeHook::quiet() });

        let pay = Call::new(f.usdc, 0, encode_transfer(&Address::from_label("bob"), 500));
        let err = f.account.execute(&mut f.ledger, &f.owner, &pay).unwrap_err();
        assert_eq!(err, AccountError::PreHookDenied { module: blocker, reason: "blocked".into() });

        // The spending module ran first, but its accumulator was restored
        match f.account.modules().get(&limits) {
            Some(Module::SpendingLimit(m)) => assert_eq!(m.limit(&f.usdc).unwrap().spent, 0),
            other => panic!("unexpected module {:?}", other),
        }
        assert!(f.ledger.calls().is_empty());
    }

    #[test]
    fn test_post_hook_veto_is_recorded_not_fatal() {
        let mut f = fixture();
        let auditor = install(&mut f, "auditor", ProbeHook { deny_post: true, ..ProbeHook::quiet() });
        let bob = Address::from_label("bob");

        f.account.execute(&mut f.ledger, &f.owner, &Call::transfer_native(bob, 5)).unwrap();
        assert_eq!(f.ledger.native_balance(&bob), 5);
        assert_eq!(
            f.ledger.events_named("ModulePostHookFailed"),
            vec![&AccountEvent::ModulePostHookFailed {
                module: auditor,
                target: bob,
                reason: "audit failed".into(),
            }]
        );
    }

    #[test]
    fn test_reentry_from_hook_fails() {
        let mut f = fixture();
        let sneaky = install(&mut f, "sneaky", ProbeHook { reenter: true, ..ProbeHook::quiet() });
        let bob = Address::from_label("bob");

        let err = f.account.execute(&mut f.ledger, &f.owner, &Call::transfer_native(bob, 5)).unwrap_err();
        assert_eq!(err, AccountError::PreHookDenied { module: sneaky, reason: "reentered".into() });
        assert_eq!(f.ledger.native_balance(&bob), 0);
        assert_eq!(f.account.modules().len(), 1);
    }

    #[test]
    fn test_batch_is_atomic() {
        let mut f = fixture();
        let bob = Address::from_label("bob");
        let sink = Address::from_label("sink");
        f.ledger.mark_reverting(sink);

        let calls = vec![Call::transfer_native(bob, 100), Call::transfer_native(sink, 1)];
        assert_eq!(
            f.account.execute_batch(&mut f.ledger, &f.owner, &calls),
            Err(AccountError::Ledger(crate::ledger::LedgerError::CallReverted(sink)))
        );
        assert_eq!(f.ledger.native_balance(&bob), 0);
        assert!(f.ledger.events_named("Executed").is_empty());

        assert_eq!(f.account.execute_batch(&mut f.ledger, &f.owner, &[]), Err(AccountError::EmptyBatch));
        let overflow = vec![Call::transfer_native(bob, Amount::MAX), Call::transfer_native(bob, 1)];
        assert_eq!(
            f.account.execute_batch(&mut f.ledger, &f.owner, &overflow),
            Err(AccountError::ValueOverflow)
        );
    }

    #[test]
    fn test_batch_pre_check_skips_modules_without_support() {
        let mut f = fixture();
        install(&mut f, "plain", ProbeHook::quiet());
        let strict = install(&mut f, "strict", ProbeHook { batch_aware: true, ..ProbeHook::quiet() });
        let bob = Address::from_label("bob");

        let two = vec![Call::transfer_native(bob, 1); 2];
        assert_eq!(f.account.execute_batch(&mut f.ledger, &f.owner, &two).unwrap().len(), 2);

        let three = vec![Call::transfer_native(bob, 1); 3];
        assert_eq!(
            f.account.execute_batch(&mut f.ledger, &f.owner, &three),
            Err(AccountError::PreHookDenied { module: strict, reason: "batch too long".into() })
        );
        assert_eq!(f.ledger.native_balance(&bob), 2);
    }

    #[test]
    fn test_registry_administration() {
        let mut f = fixture();
        let id = install(&mut f, "probe", ProbeHook::quiet());
        let stranger = Address::from_label("stranger");

        assert_eq!(
            f.account.add_module(&mut f.ledger, &f.owner, id, Module::Custom(Box::new(ProbeHook::quiet()))),
            Err(AccountError::Registry(RegistryError::Duplicate(id)))
        );
        assert_eq!(
            f.account.remove_module(&mut f.ledger, &stranger, &id).unwrap_err(),
            AccountError::NotOwner(stranger)
        );
        f.account.set_recovery_module_authorization(&mut f.ledger, &f.owner, &id, true).unwrap();
        f.account.remove_module(&mut f.ledger, &f.owner, &id).unwrap();
        assert!(!f.account.is_recovery_module(&id));
        assert_eq!(
            f.account.remove_module(&mut f.ledger, &f.owner, &id).unwrap_err(),
            AccountError::Registry(RegistryError::NotMember(id))
        );
    }

    #[test]
    fn test_transfer_ownership() {
        let mut f = fixture();
        let next = Address::from_label("next-owner");
        assert_eq!(
            f.account.transfer_ownership(&mut f.ledger, &f.owner, Address::ZERO),
            Err(AccountError::ZeroAddress)
        );
        f.account.transfer_ownership(&mut f.ledger, &f.owner, next).unwrap();
        assert_eq!(f.account.owner(), next);
        assert_eq!(
            f.account.transfer_ownership(&mut f.ledger, &f.owner, f.owner),
            Err(AccountError::NotOwner(f.owner))
        );
    }
}
