use thiserror::Error;

use crate::account::RegistryError;
use crate::calldata::DecodeError;
use crate::events::AccountEvent;
use crate::ledger::LedgerError;
use crate::modules::{RecoveryError, SpendingLimitError};
use crate::types::{Address, Amount, AssetId};
use crate::validators::SessionKeyError;

/// Broad failure categories, so clients can tell a retryable limit breach
/// from a hard authorization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authorization,
    StateConsistency,
    HookPolicy,
    ResourceExceeded,
    /// The performed call itself failed on the host.
    Execution,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccountError {
    #[error("caller {0} is not the owner")]
    NotOwner(Address),
    #[error("caller {0} is neither the owner nor the delegate")]
    NotExecutor(Address),
    #[error("caller {0} is not the delegate-execution identity")]
    NotDelegate(Address),
    #[error("module {0} is not authorized for recovery")]
    RecoveryNotAuthorized(Address),
    #[error("operation requires a top-up of {0}; the account pre-funds its own deposit")]
    TopUpRequired(Amount),

    #[error("zero identity is not allowed here")]
    ZeroAddress,
    #[error("call target is the zero identity")]
    ZeroTarget,
    #[error("batch is empty")]
    EmptyBatch,
    #[error("reentrant call while hooks are running")]
    Reentrancy,
    #[error("native value overflows")]
    ValueOverflow,
    #[error("no module registered at {0}")]
    UnknownModule(Address),
    #[error("no validator registered at {0}")]
    UnknownValidator(Address),
    #[error("extension {0} is not a {1}")]
    WrongExtension(Address, &'static str),
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("module {module} denied the call: {reason}")]
    PreHookDenied { module: Address, reason: String },
    #[error("spending limit exceeded for asset {asset}: {amount} requested, {spent} of {cap} spent")]
    LimitExceeded {
        module: Address,
        asset: AssetId,
        amount: Amount,
        spent: Amount,
        cap: Amount,
    },

    #[error("session validator {validator}: {source}")]
    Session {
        validator: Address,
        #[source]
        source: SessionKeyError,
    },
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    SpendingLimit(#[from] SpendingLimitError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl AccountError {
    pub fn session(validator: Address, source: SessionKeyError) -> Self {
        AccountError::Session { validator, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AccountError::NotOwner(_)
            | AccountError::NotExecutor(_)
            | AccountError::NotDelegate(_)
            | AccountError::RecoveryNotAuthorized(_)
            | AccountError::TopUpRequired(_) => ErrorKind::Authorization,
            AccountError::ZeroAddress
            | AccountError::ZeroTarget
            | AccountError::EmptyBatch
            | AccountError::Reentrancy
            | AccountError::ValueOverflow
            | AccountError::UnknownModule(_)
            | AccountError::UnknownValidator(_)
            | AccountError::WrongExtension(..)
            | AccountError::Registry(_)
            | AccountError::Decode(_) => ErrorKind::StateConsistency,
            AccountError::PreHookDenied { .. } => ErrorKind::HookPolicy,
            AccountError::LimitExceeded { .. } => ErrorKind::ResourceExceeded,
            AccountError::Session { source, .. } => source.kind(),
            AccountError::Recovery(e) => e.kind(),
            AccountError::SpendingLimit(_) => ErrorKind::StateConsistency,
            AccountError::Ledger(e) => e.kind(),
        }
    }

    /// Event that keeps a rejection auditable after the operation is rolled
    /// back, with the extension that raised it.
    pub fn failure_event(&self) -> Option<(Address, AccountEvent)> {
        match self {
            AccountError::LimitExceeded { module, asset, amount, spent, cap } => Some((
                *module,
                AccountEvent::SpendingLimitExceeded {
                    asset: *asset,
                    amount: *amount,
                    spent: *spent,
                    cap: *cap,
                },
            )),
            AccountError::Session { validator, source } => match source {
                SessionKeyError::CapExceeded { key, amount, spent, cap, window } => Some((
                    *validator,
                    AccountEvent::CapExceeded {
                        key: *key,
                        amount: *amount,
                        window: *window,
                        spent: *spent,
                        cap: *cap,
                    },
                )),
                SessionKeyError::TargetNotAllowed { key, target } => Some((
                    *validator,
                    AccountEvent::TargetNotAllowed { key: *key, target: *target },
                )),
                _ => None,
            },
            _ => None,
        }
    }
}
