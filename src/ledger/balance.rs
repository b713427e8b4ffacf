//! Balance tracking for the native asset and token assets

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{Address, Amount, AssetId};

/// Balance store for every holder and asset known to the host
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BalanceStore {
    /// Map of (holder, asset) -> balance
    balances: HashMap<(Address, AssetId), Amount>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("insufficient funds: {available} available, {needed} needed")]
    InsufficientFunds { available: Amount, needed: Amount },
    #[error("balance overflow")]
    Overflow,
}

impl BalanceStore {
    /// Create a new empty balance store
    pub fn new() -> Self {
        Self { balances: HashMap::new() }
    }

    /// Get balance for a holder and asset
    pub fn get_balance(&self, holder: &Address, asset: &AssetId) -> Amount {
        self.balances.get(&(*holder, *asset)).copied().unwrap_or(0)
    }

    /// Credit (add) balance to a holder
    pub fn credit(&mut self, holder: &Address, asset: &AssetId, amount: Amount) -> Result<(), BalanceError> {
        if amount == 0 {
            return Ok(());
        }

        let key = (*holder, *asset);
        let current = self.balances.get(&key).copied().unwrap_or(0);
        let new_balance = current.checked_add(amount).ok_or(BalanceError::Overflow)?;

        self.balances.insert(key, new_balance);
        Ok(())
    }

    /// Debit (subtract) balance from a holder
    pub fn debit(&mut self, holder: &Address, asset: &AssetId, amount: Amount) -> Result<(), BalanceError> {
        if amount == 0 {
            return Ok(());
        }

        let key = (*holder, *asset);
        let current = self.balances.get(&key).copied().unwrap_or(0);

        if current < amount {
            return Err(BalanceError::InsufficientFunds { available: current, needed: amount });
        }

        let new_balance = current - amount;
        if new_balance == 0 {
            self.balances.remove(&key);
        } else {
            self.balances.insert(key, new_balance);
        }

        Ok(())
    }

    /// Transfer balance from one holder to another
    pub fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        asset: &AssetId,
        amount: Amount,
    ) -> Result<(), BalanceError> {
        self.debit(from, asset, amount)?;

        if let Err(e) = self.credit(to, asset, amount) {
            // Rollback on error
            self.credit(from, asset, amount).ok();
            return Err(e);
        }

        Ok(())
    }

    /// Get total supply of an asset
    pub fn total_supply(&self, asset: &AssetId) -> Amount {
        self.balances
            .iter()
            .filter(|((_, ast), _)| ast == asset)
            .map(|(_, balance)| balance)
            .sum()
    }
}
