//! Delivery of user operations to an account, acting as its delegate.

use tracing::{info, warn};

use super::{Ledger, LedgerError};
use crate::account::{SmartAccount, UserOperation};
use crate::calldata::AccountCall;
use crate::error::AccountError;

impl Ledger {
    /// Digest an operation is signed over on this host.
    pub fn user_op_hash(&self, op: &UserOperation) -> [u8; 32] {
        op.hash(&self.entry_point, self.chain_id)
    }

    /// Authenticate, check the validity window and sequence number, then run
    /// the operation's call data against `account`.
    ///
    /// The sequence number is consumed before execution, so a failed
    /// execution still uses it up.
    pub fn handle_user_op(
        &mut self,
        account: &mut SmartAccount,
        op: &UserOperation,
    ) -> Result<Vec<Vec<u8>>, AccountError> {
        if op.sender != account.address() {
            return Err(LedgerError::WrongSender(op.sender).into());
        }

        let entry_point = self.entry_point;
        let digest = self.user_op_hash(op);
        let validation = account.validate_user_op(&entry_point, op, &digest, 0)?;

        if validation.sig_failed {
            warn!(sender = ?op.sender, nonce = op.nonce, "user operation signature rejected");
            return Err(LedgerError::SignatureRejected.into());
        }
        if !validation.is_active_at(self.now) {
            warn!(
                sender = ?op.sender,
                valid_until = validation.valid_until,
                now = self.now,
                "user operation outside its validity window"
            );
            return Err(LedgerError::OutsideValidityWindow {
                valid_after: validation.valid_after,
                valid_until: validation.valid_until,
                now: self.now,
            }
            .into());
        }

        self.consume_nonce(&op.sender, op.nonce)?;
        info!(sender = ?op.sender, nonce = op.nonce, "user operation validated");

        match AccountCall::decode(&op.call_data)? {
            AccountCall::Execute(call) => account.execute(self, &entry_point, &call).map(|r| vec![r]),
            AccountCall::ExecuteBatch(calls) => account.execute_batch(self, &entry_point, &calls),
            AccountCall::ExecuteAsSession { validator, session_key, calls } => {
                account.execute_as_session(self, &entry_point, &validator, &session_key, &calls)
            }
        }
    }
}
