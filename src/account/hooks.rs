//! Execution hooks: the capability interface modules implement, and the
//! environment a hook sees while it runs.

use std::fmt;

use super::SmartAccount;
use crate::error::AccountError;
use crate::events::AccountEvent;
use crate::ledger::Ledger;
use crate::modules::{SocialRecoveryModule, SpendingLimitModule};
use crate::types::{Address, Amount, AssetId, Call, Timestamp};

/// The call a hook is asked to judge.
#[derive(Debug, Clone, Copy)]
pub struct HookCall<'a> {
    pub caller: Address,
    pub owner: Address,
    pub account: Address,
    pub target: Address,
    pub value: Amount,
    pub payload: &'a [u8],
    pub now: Timestamp,
}

/// Batch-level view offered before any call of a batch runs.
#[derive(Debug, Clone, Copy)]
pub struct BatchCheck<'a> {
    pub caller: Address,
    pub owner: Address,
    pub calls: &'a [Call],
    /// Native value summed across the batch.
    pub total_native: Amount,
    pub now: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    LimitExceeded { asset: AssetId, amount: Amount, spent: Amount, cap: Amount },
    Policy(String),
}

impl Denial {
    pub(crate) fn into_error(self, module: Address) -> AccountError {
        match self {
            Denial::LimitExceeded { asset, amount, spent, cap } => {
                AccountError::LimitExceeded { module, asset, amount, spent, cap }
            }
            Denial::Policy(reason) => AccountError::PreHookDenied { module, reason },
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::LimitExceeded { asset, amount, spent, cap } => {
                write!(f, "limit exceeded on {}: {} requested, {} of {} spent", asset, amount, spent, cap)
            }
            Denial::Policy(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Allow,
    Deny(Denial),
}

/// Pre/post execution hook. Every method has a permissive default so a
/// module only overrides what it enforces.
pub trait HookModule {
    fn pre_hook(&mut self, _env: &mut HookEnv<'_>, _call: &HookCall<'_>) -> HookVerdict {
        HookVerdict::Allow
    }

    fn post_hook(&mut self, _env: &mut HookEnv<'_>, _call: &HookCall<'_>, _result: &[u8]) -> HookVerdict {
        HookVerdict::Allow
    }

    /// `None` when the module has no batch-level check.
    fn batch_pre_check(&mut self, _env: &mut HookEnv<'_>, _batch: &BatchCheck<'_>) -> Option<HookVerdict> {
        None
    }

    fn clone_box(&self) -> Box<dyn HookModule>;
}

/// What a running hook may touch. Calls back into the account go through the
/// normal entry points and therefore hit the reentrancy guard.
pub struct HookEnv<'a> {
    account: &'a mut SmartAccount,
    ledger: &'a mut Ledger,
    module: Address,
}

impl<'a> HookEnv<'a> {
    pub(crate) fn new(account: &'a mut SmartAccount, ledger: &'a mut Ledger, module: Address) -> Self {
        Self { account, ledger, module }
    }

    /// Id the running module is registered under.
    pub fn module(&self) -> Address {
        self.module
    }

    pub fn now(&self) -> Timestamp {
        self.ledger.now()
    }

    /// Emit an event attributed to the running module.
    pub fn emit(&mut self, event: AccountEvent) {
        self.ledger.emit(self.module, event);
    }

    pub fn execute(&mut self, caller: &Address, call: &Call) -> Result<Vec<u8>, AccountError> {
        self.account.execute(self.ledger, caller, call)
    }

    pub fn execute_batch(&mut self, caller: &Address, calls: &[Call]) -> Result<Vec<Vec<u8>>, AccountError> {
        self.account.execute_batch(self.ledger, caller, calls)
    }
}

/// An installed module: one of the built-in capabilities or a custom hook.
pub enum Module {
    SpendingLimit(SpendingLimitModule),
    SocialRecovery(SocialRecoveryModule),
    Custom(Box<dyn HookModule>),
}

impl Module {
    pub fn hook_mut(&mut self) -> &mut dyn HookModule {
        match self {
            Module::SpendingLimit(m) => m,
            Module::SocialRecovery(m) => m,
            Module::Custom(m) => m.as_mut(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Module::SpendingLimit(_) => "spending limit module",
            Module::SocialRecovery(_) => "social recovery module",
            Module::Custom(_) => "custom module",
        }
    }
}

impl Clone for Module {
    fn clone(&self) -> Self {
        match self {
            Module::SpendingLimit(m) => Module::SpendingLimit(m.clone()),
            Module::SocialRecovery(m) => Module::SocialRecovery(m.clone()),
            Module::Custom(m) => Module::Custom(m.clone_box()),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Module::SpendingLimit(m) => f.debug_tuple("SpendingLimit").field(m).finish(),
            Module::SocialRecovery(m) => f.debug_tuple("SocialRecovery").field(m).finish(),
            Module::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<SpendingLimitModule> for Module {
    fn from(m: SpendingLimitModule) -> Self {
        Module::SpendingLimit(m)
    }
}

impl From<SocialRecoveryModule> for Module {
    fn from(m: SocialRecoveryModule) -> Self {
        Module::SocialRecovery(m)
    }
}
