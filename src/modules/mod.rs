//! Built-in execution-hook modules.

pub mod social_recovery;
pub mod spending_limit;

pub use social_recovery::{Guardian, RecoveryError, RecoveryRequest, RecoveryStatus, SocialRecoveryModule};
pub use spending_limit::{SpendingLimit, SpendingLimitError, SpendingLimitModule};
