pub mod account;
pub mod calldata;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod events;
pub mod ledger; // in-memory host the account runs against
pub mod modules;
pub mod types;
pub mod validators;

pub use account::{SmartAccount, UserOperation, ValidationData};
pub use error::{AccountError, ErrorKind};
pub use ledger::Ledger;
