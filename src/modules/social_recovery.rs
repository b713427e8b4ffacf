//! Guardian-based social recovery.
//!
//! Guardians enroll in two phases (proposed, then activated after a delay)
//! and vote on a single in-flight request to replace the owner. A request
//! executes only once it has a quorum of approvals and the timelock has
//! elapsed. Guardian configuration is frozen while a request is live.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

use crate::account::HookModule;
use crate::config::RecoveryConfig;
use crate::error::ErrorKind;
use crate::events::AccountEvent;
use crate::types::{Address, Timestamp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("guardian must not be the zero identity")]
    ZeroGuardian,
    #[error("the owner cannot be its own guardian")]
    GuardianIsOwner,
    #[error("{0} is already a guardian")]
    AlreadyGuardian(Address),
    #[error("{0} is not a guardian")]
    NotGuardian(Address),
    #[error("{0} is not an active guardian")]
    NotActiveGuardian(Address),
    #[error("{0} has no pending enrollment")]
    NotPending(Address),
    #[error("guardian {guardian} can be activated from {activates_at}")]
    EnrollmentDelayNotElapsed { guardian: Address, activates_at: Timestamp },
    #[error("guardian configuration is frozen while a recovery is in progress")]
    RecoveryInProgress,
    #[error("the last guardian cannot be removed")]
    LastGuardian,
    #[error("removal would leave threshold {threshold} above {remaining} guardians")]
    QuorumBreak { threshold: u32, remaining: u32 },
    #[error("threshold {threshold} must be between 1 and {guardians}")]
    InvalidThreshold { threshold: u32, guardians: u32 },
    #[error("{0} cannot be proposed as the new owner")]
    InvalidNewOwner(Address),
    #[error("no recovery request in progress")]
    NoActiveRequest,
    #[error("guardian {guardian} already approved request {request_id}")]
    AlreadyApproved { guardian: Address, request_id: u64 },
    #[error("request has {approvals} approvals, {threshold} required")]
    ThresholdNotMet { approvals: u32, threshold: u32 },
    #[error("timelock elapses at {ready_at}")]
    TimelockNotElapsed { ready_at: Timestamp },
}

impl RecoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecoveryError::NotGuardian(_)
            | RecoveryError::NotActiveGuardian(_)
            | RecoveryError::AlreadyApproved { .. }
            | RecoveryError::ThresholdNotMet { .. }
            | RecoveryError::TimelockNotElapsed { .. } => ErrorKind::Authorization,
            _ => ErrorKind::StateConsistency,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Guardian {
    pub active: bool,
    pub pending: bool,
    pub proposed_at: Timestamp,
    pub activated_at: Option<Timestamp>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub id: u64,
    pub new_owner: Address,
    pub approvals: u32,
    pub created_at: Timestamp,
    pub executed: bool,
    pub cancelled: bool,
    approved_by: BTreeSet<Address>,
}

impl RecoveryRequest {
    pub fn is_live(&self) -> bool {
        !self.executed && !self.cancelled
    }

    pub fn has_approved(&self, guardian: &Address) -> bool {
        self.approved_by.contains(guardian)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    None,
    Pending,
    Executable,
    Executed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SocialRecoveryModule {
    guardians: BTreeMap<Address, Guardian>,
    active_count: u32,
    threshold: u32,
    manual_threshold: bool,
    request: Option<RecoveryRequest>,
    next_request_id: u64,
    timelock_secs: u64,
    enrollment_delay_secs: u64,
}

impl Default for SocialRecoveryModule {
    fn default() -> Self {
        Self::new(&RecoveryConfig::default())
    }
}

impl SocialRecoveryModule {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            guardians: BTreeMap::new(),
            active_count: 0,
            threshold: 0,
            manual_threshold: false,
            request: None,
            next_request_id: 1,
            timelock_secs: config.timelock_secs,
            enrollment_delay_secs: config.enrollment_delay_secs,
        }
    }

    // --- Views ---

    pub fn guardian(&self, id: &Address) -> Option<&Guardian> {
        self.guardians.get(id)
    }

    /// Active guardians.
    pub fn guardians(&self) -> Vec<Address> {
        self.guardians
            .iter()
            .filter(|(_, g)| g.active)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn guardian_count(&self) -> u32 {
        self.active_count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn request(&self) -> Option<&RecoveryRequest> {
        self.request.as_ref()
    }

    pub fn status(&self, now: Timestamp) -> RecoveryStatus {
        match &self.request {
            None => RecoveryStatus::None,
            Some(r) if r.executed => RecoveryStatus::Executed,
            Some(r) if r.cancelled => RecoveryStatus::Cancelled,
            Some(r) if r.approvals >= self.threshold && now >= self.ready_at(r) => RecoveryStatus::Executable,
            Some(_) => RecoveryStatus::Pending,
        }
    }

    fn ready_at(&self, request: &RecoveryRequest) -> Timestamp {
        request.created_at.saturating_add(self.timelock_secs)
    }

    fn ensure_not_frozen(&self) -> Result<(), RecoveryError> {
        if self.request.as_ref().is_some_and(RecoveryRequest::is_live) {
            return Err(RecoveryError::RecoveryInProgress);
        }
        Ok(())
    }

    fn ensure_active(&self, guardian: &Address) -> Result<(), RecoveryError> {
        match self.guardians.get(guardian) {
            Some(g) if g.active => Ok(()),
            Some(_) => Err(RecoveryError::NotActiveGuardian(*guardian)),
            None => Err(RecoveryError::NotGuardian(*guardian)),
        }
    }

    fn validate_candidate(&self, guardian: &Address, owner: &Address) -> Result<(), RecoveryError> {
        self.ensure_not_frozen()?;
        if guardian.is_zero() {
            return Err(RecoveryError::ZeroGuardian);
        }
        if guardian == owner {
            return Err(RecoveryError::GuardianIsOwner);
        }
        if self.guardians.contains_key(guardian) {
            return Err(RecoveryError::AlreadyGuardian(*guardian));
        }
        Ok(())
    }

    /// Majority unless the owner pinned the threshold. Returns the event
    /// when the threshold moved.
    fn recalculate_threshold(&mut self) -> Option<AccountEvent> {
        if self.manual_threshold {
            return None;
        }
        let majority = self.active_count / 2 + 1;
        if majority == self.threshold {
            return None;
        }
        self.threshold = majority;
        Some(AccountEvent::ThresholdChanged { threshold: majority, manual: false })
    }

    fn enroll(&mut self, guardian: Address, now: Timestamp) -> Vec<AccountEvent> {
        if let Some(g) = self.guardians.get_mut(&guardian) {
            g.active = true;
            g.pending = false;
            g.activated_at = Some(now);
        }
        self.active_count += 1;
        let mut events = vec![AccountEvent::GuardianAdded { guardian }];
        events.extend(self.recalculate_threshold());
        info!(guardian = ?guardian, guardians = self.active_count, threshold = self.threshold, "guardian active");
        events
    }

    // --- Guardian management (owner-only unless noted) ---

    /// First enrollment phase: the guardian becomes activatable after the
    /// enrollment delay.
    pub fn propose_guardian(
        &mut self,
        guardian: Address,
        owner: &Address,
        now: Timestamp,
    ) -> Result<Vec<AccountEvent>, RecoveryError> {
        self.validate_candidate(&guardian, owner)?;
        self.guardians.insert(
            guardian,
            Guardian { active: false, pending: true, proposed_at: now, activated_at: None },
        );
        let activates_at = now.saturating_add(self.enrollment_delay_secs);
        info!(guardian = ?guardian, activates_at, "guardian proposed");
        Ok(vec![AccountEvent::GuardianProposed { guardian, activates_at }])
    }

    /// Second enrollment phase. Anyone may trigger it once the delay elapsed.
    pub fn activate_guardian(&mut self, guardian: Address, now: Timestamp) -> Result<Vec<AccountEvent>, RecoveryError> {
        self.ensure_not_frozen()?;
        let g = self.guardians.get(&guardian).ok_or(RecoveryError::NotGuardian(guardian))?;
        if !g.pending {
            return Err(RecoveryError::NotPending(guardian));
        }
        let activates_at = g.proposed_at.saturating_add(self.enrollment_delay_secs);
        if now < activates_at {
            return Err(RecoveryError::EnrollmentDelayNotElapsed { guardian, activates_at });
        }
        Ok(self.enroll(guardian, now))
    }

    /// Immediate enrollment, skipping the delay.
    pub fn add_guardian(
        &mut self,
        guardian: Address,
        owner: &Address,
        now: Timestamp,
    ) -> Result<Vec<AccountEvent>, RecoveryError> {
        self.validate_candidate(&guardian, owner)?;
        self.guardians.insert(
            guardian,
            Guardian { active: false, pending: false, proposed_at: now, activated_at: None },
        );
        Ok(self.enroll(guardian, now))
    }

    /// Remove an active guardian, or withdraw a pending enrollment.
    pub fn remove_guardian(&mut self, guardian: &Address) -> Result<Vec<AccountEvent>, RecoveryError> {
        self.ensure_not_frozen()?;
        let active = self
            .guardians
            .get(guardian)
            .map(|g| g.active)
            .ok_or(RecoveryError::NotGuardian(*guardian))?;

        if active {
            if self.active_count <= 1 {
                return Err(RecoveryError::LastGuardian);
            }
            let remaining = self.active_count - 1;
            if self.manual_threshold && self.threshold > remaining {
                return Err(RecoveryError::QuorumBreak { threshold: self.threshold, remaining });
            }
            self.active_count = remaining;
        }

        self.guardians.remove(guardian);
        let mut events = vec![AccountEvent::GuardianRemoved { guardian: *guardian }];
        if active {
            events.extend(self.recalculate_threshold());
        }
        info!(guardian = ?guardian, guardians = self.active_count, "guardian removed");
        Ok(events)
    }

    pub fn set_threshold(&mut self, threshold: u32) -> Result<Vec<AccountEvent>, RecoveryError> {
        self.ensure_not_frozen()?;
        if threshold == 0 || threshold > self.active_count {
            return Err(RecoveryError::InvalidThreshold { threshold, guardians: self.active_count });
        }
        self.threshold = threshold;
        self.manual_threshold = true;
        info!(threshold, "guardian threshold pinned");
        Ok(vec![AccountEvent::ThresholdChanged { threshold, manual: true }])
    }

    // --- Recovery flow ---

    /// Open a request on behalf of an active guardian, counting its approval.
    pub fn initiate_recovery(
        &mut self,
        guardian: &Address,
        new_owner: Address,
        current_owner: &Address,
        now: Timestamp,
    ) -> Result<Vec<AccountEvent>, RecoveryError> {
        self.ensure_active(guardian)?;
        self.ensure_not_frozen()?;
        if new_owner.is_zero() || new_owner == *current_owner {
            return Err(RecoveryError::InvalidNewOwner(new_owner));
        }

        let id = self.next_request_id;
        self.next_request_id += 1;
        self.request = Some(RecoveryRequest {
            id,
            new_owner,
            approvals: 1,
            created_at: now,
            executed: false,
            cancelled: false,
            approved_by: BTreeSet::from([*guardian]),
        });
        info!(request_id = id, guardian = ?guardian, new_owner = ?new_owner, "recovery initiated");
        Ok(vec![
            AccountEvent::RecoveryInitiated { request_id: id, guardian: *guardian, new_owner },
            AccountEvent::RecoveryApproved { request_id: id, guardian: *guardian, approvals: 1 },
        ])
    }

    pub fn support_recovery(&mut self, guardian: &Address) -> Result<Vec<AccountEvent>, RecoveryError> {
        self.ensure_active(guardian)?;
        let request = self
            .request
            .as_mut()
            .filter(|r| r.is_live())
            .ok_or(RecoveryError::NoActiveRequest)?;
        if request.has_approved(guardian) {
            return Err(RecoveryError::AlreadyApproved { guardian: *guardian, request_id: request.id });
        }
        request.approved_by.insert(*guardian);
        request.approvals += 1;
        info!(request_id = request.id, guardian = ?guardian, approvals = request.approvals, "recovery approved");
        Ok(vec![AccountEvent::RecoveryApproved {
            request_id: request.id,
            guardian: *guardian,
            approvals: request.approvals,
        }])
    }

    /// Mark the live request executed once quorum and timelock both hold.
    /// Returns the request id and the owner to install.
    pub fn execute_recovery(&mut self, now: Timestamp) -> Result<(u64, Address), RecoveryError> {
        let threshold = self.threshold;
        let timelock = self.timelock_secs;
        let request = self
            .request
            .as_mut()
            .filter(|r| r.is_live())
            .ok_or(RecoveryError::NoActiveRequest)?;

        if request.approvals < threshold {
            warn!(request_id = request.id, approvals = request.approvals, threshold, "recovery lacks quorum");
            return Err(RecoveryError::ThresholdNotMet { approvals: request.approvals, threshold });
        }
        let ready_at = request.created_at.saturating_add(timelock);
        if now < ready_at {
            warn!(request_id = request.id, ready_at, now, "recovery timelock not elapsed");
            return Err(RecoveryError::TimelockNotElapsed { ready_at });
        }

        request.executed = true;
        info!(request_id = request.id, new_owner = ?request.new_owner, "recovery executed");
        Ok((request.id, request.new_owner))
    }

    pub fn cancel_recovery(&mut self) -> Result<Vec<AccountEvent>, RecoveryError> {
        let request = self
            .request
            .as_mut()
            .filter(|r| r.is_live())
            .ok_or(RecoveryError::NoActiveRequest)?;
        request.cancelled = true;
        info!(request_id = request.id, "recovery cancelled");
        Ok(vec![AccountEvent::RecoveryCancelled { request_id: request.id }])
    }
}

// Recovery contributes no execution policy; it is a module so the account can
// authorize it for ownership changes.
impl HookModule for SocialRecoveryModule {
    fn clone_box(&self) -> Box<dyn HookModule> {
        Box::new(self.clone())
    }
}
