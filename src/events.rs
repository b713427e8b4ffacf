use serde::{Deserialize, Serialize};

use crate::types::{Address, Amount, AssetId, Selector, Timestamp};

/// Observable side effects, consumed by the indexing collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AccountEvent {
    // --- Execution pipeline ---
    Executed {
        caller: Address,
        target: Address,
        value: Amount,
        selector: Selector,
    },
    OwnerChanged {
        previous: Address,
        new_owner: Address,
        via_recovery_module: Option<Address>,
    },
    DelegateChanged {
        previous: Option<Address>,
        delegate: Address,
    },
    ModuleAdded { module: Address },
    ModuleRemoved { module: Address },
    ValidatorAdded { validator: Address },
    ValidatorRemoved { validator: Address },
    RecoveryModuleAuthorizationChanged { module: Address, authorized: bool },
    ModulePostHookFailed { module: Address, target: Address, reason: String },

    // --- Social recovery ---
    GuardianProposed { guardian: Address, activates_at: Timestamp },
    GuardianAdded { guardian: Address },
    GuardianRemoved { guardian: Address },
    ThresholdChanged { threshold: u32, manual: bool },
    RecoveryInitiated { request_id: u64, guardian: Address, new_owner: Address },
    RecoveryApproved { request_id: u64, guardian: Address, approvals: u32 },
    RecoveryExecuted { request_id: u64, new_owner: Address },
    RecoveryCancelled { request_id: u64 },

    // --- Session keys ---
    SessionGranted { key: Address, expiry: Timestamp },
    SessionRevoked { key: Address },
    SelectorAllowanceChanged { key: Address, selector: Selector, allowed: bool },
    SessionCapSet { key: Address, daily_cap: Amount },
    TargetRestrictionChanged { key: Address, enabled: bool },
    TargetAllowanceChanged { key: Address, target: Address, allowed: bool },
    CapConsumed { key: Address, amount: Amount, window: u64, spent: Amount },
    CapExceeded { key: Address, amount: Amount, window: u64, spent: Amount, cap: Amount },
    TargetNotAllowed { key: Address, target: Address },

    // --- Spending limits ---
    SpendingLimitSet { asset: AssetId, cap: Amount, decimals: u8, normalized: bool },
    SpendingLimitRemoved { asset: AssetId },
    SpendingLimitExceeded { asset: AssetId, amount: Amount, spent: Amount, cap: Amount },
    OwnerBypassEnabled { until: Timestamp },
    OwnerBypassDisabled,
    SpendingLimitBypassed { asset: AssetId, amount: Amount },
}

impl AccountEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AccountEvent::Executed { .. } => "Executed",
            AccountEvent::OwnerChanged { .. } => "OwnerChanged",
            AccountEvent::DelegateChanged { .. } => "DelegateChanged",
            AccountEvent::ModuleAdded { .. } => "ModuleAdded",
            AccountEvent::ModuleRemoved { .. } => "ModuleRemoved",
            AccountEvent::ValidatorAdded { .. } => "ValidatorAdded",
            AccountEvent::ValidatorRemoved { .. } => "ValidatorRemoved",
            AccountEvent::RecoveryModuleAuthorizationChanged { .. } => {
                "RecoveryModuleAuthorizationChanged"
            }
            AccountEvent::ModulePostHookFailed { .. } => "ModulePostHookFailed",
            AccountEvent::GuardianProposed { .. } => "GuardianProposed",
            AccountEvent::GuardianAdded { .. } => "GuardianAdded",
            AccountEvent::GuardianRemoved { .. } => "GuardianRemoved",
            AccountEvent::ThresholdChanged { .. } => "ThresholdChanged",
            AccountEvent::RecoveryInitiated { .. } => "RecoveryInitiated",
            AccountEvent::RecoveryApproved { .. } => "RecoveryApproved",
            AccountEvent::RecoveryExecuted { .. } => "RecoveryExecuted",
            AccountEvent::RecoveryCancelled { .. } => "RecoveryCancelled",
            AccountEvent::SessionGranted { .. } => "SessionGranted",
            AccountEvent::SessionRevoked { .. } => "SessionRevoked",
            AccountEvent::SelectorAllowanceChanged { .. } => "SelectorAllowanceChanged",
            AccountEvent::SessionCapSet { .. } => "SessionCapSet",
            AccountEvent::TargetRestrictionChanged { .. } => "TargetRestrictionChanged",
            AccountEvent::TargetAllowanceChanged { .. } => "TargetAllowanceChanged",
            AccountEvent::CapConsumed { .. } => "CapConsumed",
            AccountEvent::CapExceeded { .. } => "CapExceeded",
            AccountEvent::TargetNotAllowed { .. } => "TargetNotAllowed",
            AccountEvent::SpendingLimitSet { .. } => "SpendingLimitSet",
            AccountEvent::SpendingLimitRemoved { .. } => "SpendingLimitRemoved",
            AccountEvent::SpendingLimitExceeded { .. } => "SpendingLimitExceeded",
            AccountEvent::OwnerBypassEnabled { .. } => "OwnerBypassEnabled",
            AccountEvent::OwnerBypassDisabled => "OwnerBypassDisabled",
            AccountEvent::SpendingLimitBypassed { .. } => "SpendingLimitBypassed",
        }
    }
}

/// An event as recorded by the host, stamped with its emitter and time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub emitter: Address,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub event: AccountEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let logged = LoggedEvent {
            emitter: Address::from_label("account"),
            timestamp: 42,
            event: AccountEvent::SpendingLimitBypassed { asset: Address::from_label("usdc"), amount: 500 },
        };
        let json = serde_json::to_value(&logged).unwrap();
        assert_eq!(json["event"], "SpendingLimitBypassed");
        assert_eq!(json["timestamp"], 42);
        assert_eq!(logged.event.name(), "SpendingLimitBypassed");
    }
}
