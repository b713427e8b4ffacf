//! Rolling-window spending caps per asset, with a time-boxed owner bypass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::account::{BatchCheck, Denial, HookCall, HookEnv, HookModule, HookVerdict};
use crate::calldata::parse_token_transfer;
use crate::config::SpendingConfig;
use crate::events::AccountEvent;
use crate::types::{Amount, AssetId, Timestamp, NATIVE_ASSET};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpendingLimitError {
    #[error("no spending limit configured for asset {0}")]
    UnknownAsset(AssetId),
    #[error("bypass of {requested}s exceeds the maximum of {max}s")]
    BypassTooLong { requested: u64, max: u64 },
    #[error("bypass duration must be positive")]
    ZeroDuration,
    #[error("cap of {cap} whole tokens with {decimals} decimals overflows")]
    CapOverflow { cap: Amount, decimals: u8 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SpendingLimit {
    /// Zero means unrestricted.
    pub cap: Amount,
    pub window_start: Timestamp,
    pub spent: Amount,
    pub decimals: u8,
    /// When set, `cap` is in whole tokens.
    pub normalized: bool,
}

impl SpendingLimit {
    /// Cap in the asset's smallest unit.
    pub fn effective_cap(&self) -> Option<Amount> {
        if !self.normalized {
            return Some(self.cap);
        }
        10u128
            .checked_pow(u32::from(self.decimals))
            .and_then(|scale| self.cap.checked_mul(scale))
    }

    fn roll(&mut self, now: Timestamp, window_secs: u64) {
        if now >= self.window_start.saturating_add(window_secs) {
            self.window_start = now;
            self.spent = 0;
        }
    }

    fn spent_at(&self, now: Timestamp, window_secs: u64) -> Amount {
        if now >= self.window_start.saturating_add(window_secs) {
            0
        } else {
            self.spent
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpendingLimitModule {
    limits: BTreeMap<AssetId, SpendingLimit>,
    bypass_until: Option<Timestamp>,
    window_secs: u64,
    max_bypass_secs: u64,
}

impl Default for SpendingLimitModule {
    fn default() -> Self {
        Self::new(&SpendingConfig::default())
    }
}

impl SpendingLimitModule {
    pub fn new(config: &SpendingConfig) -> Self {
        Self {
            limits: BTreeMap::new(),
            bypass_until: None,
            window_secs: config.window_secs,
            max_bypass_secs: config.max_bypass_secs,
        }
    }

    pub fn limit(&self, asset: &AssetId) -> Option<&SpendingLimit> {
        self.limits.get(asset)
    }

    /// Configure the cap for `asset`. An existing window and its spend are kept.
    pub fn set_limit(
        &mut self,
        asset: AssetId,
        cap: Amount,
        decimals: u8,
        normalized: bool,
        now: Timestamp,
    ) -> Result<AccountEvent, SpendingLimitError> {
        let (window_start, spent) = self
            .limits
            .get(&asset)
            .map(|l| (l.window_start, l.spent))
            .unwrap_or((now, 0));
        let limit = SpendingLimit { cap, window_start, spent, decimals, normalized };
        if limit.effective_cap().is_none() {
            return Err(SpendingLimitError::CapOverflow { cap, decimals });
        }
        self.limits.insert(asset, limit);
        info!(asset = ?asset, cap, decimals, normalized, "spending limit set");
        Ok(AccountEvent::SpendingLimitSet { asset, cap, decimals, normalized })
    }

    pub fn remove_limit(&mut self, asset: &AssetId) -> Result<AccountEvent, SpendingLimitError> {
        self.limits.remove(asset).ok_or(SpendingLimitError::UnknownAsset(*asset))?;
        Ok(AccountEvent::SpendingLimitRemoved { asset: *asset })
    }

    pub fn enable_owner_bypass(&mut self, duration: u64, now: Timestamp) -> Result<AccountEvent, SpendingLimitError> {
        if duration == 0 {
            return Err(SpendingLimitError::ZeroDuration);
        }
        if duration > self.max_bypass_secs {
            return Err(SpendingLimitError::BypassTooLong { requested: duration, max: self.max_bypass_secs });
        }
        let until = now.saturating_add(duration);
        self.bypass_until = Some(until);
        info!(until, "owner bypass enabled");
        Ok(AccountEvent::OwnerBypassEnabled { until })
    }

    pub fn disable_owner_bypass(&mut self) -> AccountEvent {
        self.bypass_until = None;
        AccountEvent::OwnerBypassDisabled
    }

    pub fn bypass_active(&self, now: Timestamp) -> bool {
        self.bypass_until.is_some_and(|until| now < until)
    }

    /// Allowance left in the current window; `None` when the asset is
    /// unrestricted.
    pub fn remaining(&self, asset: &AssetId, now: Timestamp) -> Option<Amount> {
        let limit = self.limits.get(asset)?;
        let cap = limit.effective_cap()?;
        if cap == 0 {
            return None;
        }
        Some(cap.saturating_sub(limit.spent_at(now, self.window_secs)))
    }

    /// Roll the window if it elapsed, then record `amount` or deny it.
    pub fn check_and_consume(&mut self, asset: &AssetId, amount: Amount, now: Timestamp) -> Result<(), Denial> {
        let window_secs = self.window_secs;
        let Some(limit) = self.limits.get_mut(asset) else {
            return Ok(());
        };
        let cap = limit.effective_cap().unwrap_or(Amount::MAX);
        if cap == 0 {
            return Ok(());
        }

        limit.roll(now, window_secs);
        match limit.spent.checked_add(amount) {
            Some(total) if total <= cap => {
                limit.spent = total;
                Ok(())
            }
            _ => {
                warn!(asset = ?asset, amount, spent = limit.spent, cap, "spending limit exceeded");
                Err(Denial::LimitExceeded { asset: *asset, amount, spent: limit.spent, cap })
            }
        }
    }

    fn is_limited(&self, asset: &AssetId) -> bool {
        self.limits
            .get(asset)
            .and_then(SpendingLimit::effective_cap)
            .is_some_and(|cap| cap > 0)
    }
}

/// Assets a call moves out of the account: native value, and a recognised
/// token transfer on the call target.
fn outflows(call: &HookCall<'_>) -> Vec<(AssetId, Amount)> {
    let mut out = Vec::new();
    if call.value > 0 {
        out.push((NATIVE_ASSET, call.value));
    }
    if let Some(transfer) = parse_token_transfer(call.payload) {
        out.push((call.target, transfer.amount));
    }
    out
}

impl HookModule for SpendingLimitModule {
    fn pre_hook(&mut self, env: &mut HookEnv<'_>, call: &HookCall<'_>) -> HookVerdict {
        let spends = outflows(call);
        if call.caller == call.owner && self.bypass_active(call.now) {
            for (asset, amount) in spends.into_iter().filter(|(asset, _)| self.is_limited(asset)) {
                info!(asset = ?asset, amount, "spending limit bypassed by owner");
                env.emit(AccountEvent::SpendingLimitBypassed { asset, amount });
            }
            return HookVerdict::Allow;
        }

        for (asset, amount) in spends {
            if let Err(denial) = self.check_and_consume(&asset, amount, call.now) {
                return HookVerdict::Deny(denial);
            }
        }
        HookVerdict::Allow
    }

    fn batch_pre_check(&mut self, _env: &mut HookEnv<'_>, batch: &BatchCheck<'_>) -> Option<HookVerdict> {
        if batch.total_native == 0 || (batch.caller == batch.owner && self.bypass_active(batch.now)) {
            return Some(HookVerdict::Allow);
        }
        let Some(remaining) = self.remaining(&NATIVE_ASSET, batch.now) else {
            return Some(HookVerdict::Allow);
        };
        if batch.total_native <= remaining {
            return Some(HookVerdict::Allow);
        }

        let limit = self.limits.get(&NATIVE_ASSET);
        let cap = limit.and_then(SpendingLimit::effective_cap).unwrap_or(0);
        Some(HookVerdict::Deny(Denial::LimitExceeded {
            asset: NATIVE_ASSET,
            amount: batch.total_native,
            spent: cap.saturating_sub(remaining),
            cap,
        }))
    }

    fn clone_box(&self) -> Box<dyn HookModule> {
        Box::new(self.clone())
    }
}
