//! In-memory host ledger.
//!
//! Models the host boundary the account runs against: a clock, native and
//! token balances, an ordered event log, a call trace, per-sender sequence
//! numbers and the entry-point flow that delivers user operations.

pub mod balance;
pub mod entry_point;

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info};

use crate::calldata::{encode_transfer_result, parse_token_transfer};
use crate::error::ErrorKind;
use crate::events::{AccountEvent, LoggedEvent};
use crate::types::{Address, Amount, AssetId, Call, Timestamp, NATIVE_ASSET};

pub use balance::{BalanceError, BalanceStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("call to {0} reverted")]
    CallReverted(Address),
    #[error("balance error on asset {asset}: {source}")]
    Balance {
        asset: AssetId,
        #[source]
        source: BalanceError,
    },
    #[error("operation sender {0} is not the account being driven")]
    WrongSender(Address),
    #[error("signature rejected by the account")]
    SignatureRejected,
    #[error("operation valid between {valid_after} and {valid_until}, now {now}")]
    OutsideValidityWindow {
        valid_after: Timestamp,
        valid_until: Timestamp,
        now: Timestamp,
    },
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::CallReverted(_) | LedgerError::Balance { .. } => ErrorKind::Execution,
            LedgerError::WrongSender(_)
            | LedgerError::SignatureRejected
            | LedgerError::OutsideValidityWindow { .. } => ErrorKind::Authorization,
            LedgerError::InvalidNonce { .. } => ErrorKind::StateConsistency,
        }
    }
}

/// One performed call, as the host saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub from: Address,
    pub call: Call,
    pub timestamp: Timestamp,
}

/// Saved host state for all-or-nothing operations.
#[derive(Debug, Clone)]
pub struct LedgerCheckpoint {
    balances: BalanceStore,
    events_len: usize,
    calls_len: usize,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    now: Timestamp,
    chain_id: u64,
    entry_point: Address,
    balances: BalanceStore,
    tokens: BTreeSet<AssetId>,
    reverting: BTreeSet<Address>,
    events: Vec<LoggedEvent>,
    calls: Vec<CallRecord>,
    nonces: HashMap<Address, u64>,
}

impl Ledger {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now,
            chain_id: 1,
            entry_point: Address::from_label("entry-point"),
            balances: BalanceStore::new(),
            tokens: BTreeSet::new(),
            reverting: BTreeSet::new(),
            events: Vec::new(),
            calls: Vec::new(),
            nonces: HashMap::new(),
        }
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    // --- Clock ---

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn set_time(&mut self, now: Timestamp) {
        self.now = now;
    }

    pub fn advance(&mut self, secs: u64) {
        self.now = self.now.saturating_add(secs);
    }

    // --- Identity of the host ---

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// The delegate-execution identity this host uses to deliver user operations.
    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    // --- Assets ---

    pub fn register_token(&mut self, token: AssetId) {
        self.tokens.insert(token);
    }

    /// Make every call to `target` revert.
    pub fn mark_reverting(&mut self, target: Address) {
        self.reverting.insert(target);
    }

    pub fn mint(&mut self, holder: &Address, asset: &AssetId, amount: Amount) -> Result<(), LedgerError> {
        self.balances
            .credit(holder, asset, amount)
            .map_err(|source| LedgerError::Balance { asset: *asset, source })
    }

    pub fn balance_of(&self, holder: &Address, asset: &AssetId) -> Amount {
        self.balances.get_balance(holder, asset)
    }

    pub fn native_balance(&self, holder: &Address) -> Amount {
        self.balances.get_balance(holder, &NATIVE_ASSET)
    }

    /// Perform `call` on behalf of `from`. Native value moves to the target;
    /// recognised transfers on registered tokens move token balances.
    /// Allowances are not modelled, so a delegated transfer only succeeds when
    /// its `from` is the caller itself.
    pub fn call(&mut self, from: &Address, call: &Call) -> Result<Vec<u8>, LedgerError> {
        if self.reverting.contains(&call.target) {
            debug!(target_addr = %call.target, "call reverted by target");
            return Err(LedgerError::CallReverted(call.target));
        }

        let checkpoint = self.balances.clone();
        let result = self.apply_call(from, call);
        if result.is_err() {
            self.balances = checkpoint;
        }
        let return_data = result?;

        self.calls.push(CallRecord { from: *from, call: call.clone(), timestamp: self.now });
        Ok(return_data)
    }

    fn apply_call(&mut self, from: &Address, call: &Call) -> Result<Vec<u8>, LedgerError> {
        if call.value > 0 {
            self.balances
                .transfer(from, &call.target, &NATIVE_ASSET, call.value)
                .map_err(|source| LedgerError::Balance { asset: NATIVE_ASSET, source })?;
        }

        if !self.tokens.contains(&call.target) {
            return Ok(Vec::new());
        }

        let Some(transfer) = parse_token_transfer(&call.payload) else {
            return Err(LedgerError::CallReverted(call.target));
        };
        let owner = transfer.from.unwrap_or(*from);
        if owner != *from {
            return Err(LedgerError::CallReverted(call.target));
        }
        self.balances
            .transfer(&owner, &transfer.to, &call.target, transfer.amount)
            .map_err(|source| LedgerError::Balance { asset: call.target, source })?;

        Ok(encode_transfer_result(true))
    }

    pub fn calls(&self) -> &[CallRecord] {
        &self.calls
    }

    // --- Events ---

    pub fn emit(&mut self, emitter: Address, event: AccountEvent) {
        info!(emitter = ?emitter, event = event.name(), "event");
        self.events.push(LoggedEvent { emitter, timestamp: self.now, event });
    }

    pub fn events(&self) -> &[LoggedEvent] {
        &self.events
    }

    /// Events with the given name, in emission order.
    pub fn events_named(&self, name: &str) -> Vec<&AccountEvent> {
        self.events
            .iter()
            .filter(|e| e.event.name() == name)
            .map(|e| &e.event)
            .collect()
    }

    /// JSON-lines export for the indexing collaborator.
    pub fn export_events_json(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }

    // --- Checkpoints ---

    pub fn checkpoint(&self) -> LedgerCheckpoint {
        LedgerCheckpoint {
            balances: self.balances.clone(),
            events_len: self.events.len(),
            calls_len: self.calls.len(),
        }
    }

    pub fn rollback(&mut self, checkpoint: LedgerCheckpoint) {
        self.balances = checkpoint.balances;
        self.events.truncate(checkpoint.events_len);
        self.calls.truncate(checkpoint.calls_len);
    }

    // --- Sequence numbers ---

    pub fn nonce_of(&self, sender: &Address) -> u64 {
        self.nonces.get(sender).copied().unwrap_or(0)
    }

    fn consume_nonce(&mut self, sender: &Address, nonce: u64) -> Result<(), LedgerError> {
        let expected = self.nonce_of(sender);
        if nonce != expected {
            return Err(LedgerError::InvalidNonce { expected, got: nonce });
        }
        self.nonces.insert(*sender, expected + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calldata::{encode_transfer, encode_transfer_from};

    fn funded() -> (Ledger, Address, Address) {
        let mut ledger = Ledger::new(1_000);
        let account = Address::from_label("account");
        let usdc = Address::from_label("usdc");
        ledger.register_token(usdc);
        ledger.mint(&account, &NATIVE_ASSET, 100).unwrap();
        ledger.mint(&account, &usdc, 1_000).unwrap();
        (ledger, account, usdc)
    }

    #[test]
    fn test_native_and_token_calls() {
        let (mut ledger, account, usdc) = funded();
        let bob = Address::from_label("bob");

        ledger.call(&account, &Call::transfer_native(bob, 40)).unwrap();
        let ret = ledger.call(&account, &Call::new(usdc, 0, encode_transfer(&bob, 250))).unwrap();

        assert_eq!(ret, encode_transfer_result(true));
        assert_eq!(ledger.native_balance(&bob), 40);
        assert_eq!(ledger.balance_of(&bob, &usdc), 250);
        assert_eq!(ledger.calls().len(), 2);
    }

    #[test]
    fn test_failed_call_leaves_no_trace() {
        let (mut ledger, account, usdc) = funded();
        let bob = Address::from_label("bob");

        // Value moves first, then the token leg fails
        let call = Call::new(usdc, 10, encode_transfer(&bob, 5_000));
        assert!(matches!(ledger.call(&account, &call), Err(LedgerError::Balance { .. })));
        assert_eq!(ledger.native_balance(&account), 100);
        assert!(ledger.calls().is_empty());

        // Delegated transfer of someone else's funds reverts
        let steal = Call::new(usdc, 0, encode_transfer_from(&bob, &account, 1));
        assert_eq!(ledger.call(&account, &steal), Err(LedgerError::CallReverted(usdc)));
    }

    #[test]
    fn test_checkpoint_rollback() {
        let (mut ledger, account, _) = funded();
        let cp = ledger.checkpoint();
        ledger.call(&account, &Call::transfer_native(Address::from_label("bob"), 10)).unwrap();
        ledger.emit(account, AccountEvent::OwnerBypassDisabled);
        ledger.rollback(cp);
        assert_eq!(ledger.native_balance(&account), 100);
        assert!(ledger.events().is_empty());
        assert!(ledger.calls().is_empty());
    }

    #[test]
    fn test_reverting_target_and_export() {
        let (mut ledger, account, _) = funded();
        let sink = Address::from_label("sink");
        ledger.mark_reverting(sink);
        assert_eq!(
            ledger.call(&account, &Call::transfer_native(sink, 1)),
            Err(LedgerError::CallReverted(sink))
        );

        ledger.emit(account, AccountEvent::OwnerBypassDisabled);
        let json = ledger.export_events_json().unwrap();
        assert_eq!(json.lines().count(), 1);
        assert!(json.contains("OwnerBypassDisabled"));
    }

    #[test]
    fn test_nonce_sequence() {
        let mut ledger = Ledger::new(0);
        let sender = Address::from_label("account");
        ledger.consume_nonce(&sender, 0).unwrap();
        assert_eq!(
            ledger.consume_nonce(&sender, 0),
            Err(LedgerError::InvalidNonce { expected: 1, got: 0 })
        );
        assert_eq!(ledger.nonce_of(&sender), 1);
    }
}
