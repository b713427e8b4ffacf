//! Social-recovery administration and the restricted ownership-change entry
//! point recovery modules petition.

use tracing::info;

use super::{Module, SmartAccount};
use crate::error::AccountError;
use crate::events::AccountEvent;
use crate::ledger::Ledger;
use crate::modules::{RecoveryError, RecoveryRequest, SocialRecoveryModule};
use crate::types::{Address, Timestamp};

impl SmartAccount {
    /// Replace the owner on behalf of `module`. Only a registered module
    /// authorized for recovery may call this.
    pub(crate) fn recover_ownership(
        &mut self,
        ledger: &mut Ledger,
        module: &Address,
        new_owner: Address,
    ) -> Result<(), AccountError> {
        if !self.modules.contains(module) {
            return Err(AccountError::UnknownModule(*module));
        }
        if !self.recovery_modules.contains(module) {
            return Err(AccountError::RecoveryNotAuthorized(*module));
        }
        self.change_owner(ledger, new_owner, Some(*module))
    }

    /// The owner may not detach a recovery module from the account while one
    /// of its requests is live.
    pub(super) fn ensure_no_live_recovery(&self, module: &Address) -> Result<(), AccountError> {
        if let Some(Module::SocialRecovery(m)) = self.modules.get(module) {
            if m.request().is_some_and(RecoveryRequest::is_live) {
                return Err(RecoveryError::RecoveryInProgress.into());
            }
        }
        Ok(())
    }

    /// Run a recovery-module operation and emit its events under the module id.
    fn with_recovery(
        &mut self,
        ledger: &mut Ledger,
        module: &Address,
        f: impl FnOnce(&mut SocialRecoveryModule, &Address, Timestamp) -> Result<Vec<AccountEvent>, RecoveryError>,
    ) -> Result<(), AccountError> {
        let owner = self.owner;
        let now = ledger.now();
        let events = f(self.social_recovery_mut(module)?, &owner, now)?;
        for event in events {
            ledger.emit(*module, event);
        }
        Ok(())
    }

    // --- Guardian set (owner-only) ---

    pub fn propose_guardian(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        guardian: Address,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        self.with_recovery(ledger, module, |m, owner, now| m.propose_guardian(guardian, owner, now))
    }

    pub fn add_guardian(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        guardian: Address,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        self.with_recovery(ledger, module, |m, owner, now| m.add_guardian(guardian, owner, now))
    }

    pub fn remove_guardian(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        guardian: &Address,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        self.with_recovery(ledger, module, |m, _, _| m.remove_guardian(guardian))
    }

    pub fn set_guardian_threshold(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        threshold: u32,
    ) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        self.with_recovery(ledger, module, |m, _, _| m.set_threshold(threshold))
    }

    /// Anyone may complete an enrollment once its delay elapsed.
    pub fn activate_guardian(&mut self, ledger: &mut Ledger, module: &Address, guardian: Address) -> Result<(), AccountError> {
        self.with_recovery(ledger, module, |m, _, now| m.activate_guardian(guardian, now))
    }

    // --- Recovery flow ---

    /// `caller` must be an active guardian.
    pub fn initiate_recovery(
        &mut self,
        ledger: &mut Ledger,
        caller: &Address,
        module: &Address,
        new_owner: Address,
    ) -> Result<(), AccountError> {
        self.with_recovery(ledger, module, |m, owner, now| m.initiate_recovery(caller, new_owner, owner, now))
    }

    pub fn support_recovery(&mut self, ledger: &mut Ledger, caller: &Address, module: &Address) -> Result<(), AccountError> {
        self.with_recovery(ledger, module, |m, _, _| m.support_recovery(caller))
    }

    /// Anyone may execute a request that reached quorum and cleared the
    /// timelock. Returns the new owner.
    pub fn execute_recovery(&mut self, ledger: &mut Ledger, module: &Address) -> Result<Address, AccountError> {
        self.atomically(ledger, |account, ledger| {
            let now = ledger.now();
            let (request_id, new_owner) = account.social_recovery_mut(module)?.execute_recovery(now)?;
            account.recover_ownership(ledger, module, new_owner)?;
            ledger.emit(*module, AccountEvent::RecoveryExecuted { request_id, new_owner });
            info!(account = ?account.address, request_id, new_owner = ?new_owner, "account recovered");
            Ok(new_owner)
        })
    }

    pub fn cancel_recovery(&mut self, ledger: &mut Ledger, caller: &Address, module: &Address) -> Result<(), AccountError> {
        self.ensure_owner(caller)?;
        self.with_recovery(ledger, module, |m, _, _| m.cancel_recovery())
    }
}
