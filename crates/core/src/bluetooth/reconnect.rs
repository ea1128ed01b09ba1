//! Bounded recovery after unexpected link loss.
//!
//! The policy is a pure decision function, so every branch is testable
//! without a radio. The manager executes the returned action and records
//! the spent attempt when it actually re-issues the connect.

use super::environment::Precondition;

/// Book-keeping for the recovery of one connection session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectContext {
    /// Address the most recent connect was issued for.
    pub address: Option<String>,
    /// Reconnect attempts already spent in this session.
    pub attempts_used: u32,
    /// Set when the current disconnect was requested by the user.
    pub user_initiated: bool,
}

impl ReconnectContext {
    /// Fresh context for a newly requested target.
    pub fn for_target(address: &str) -> Self {
        Self {
            address: Some(address.to_owned()),
            attempts_used: 0,
            user_initiated: false,
        }
    }
}

/// What the manager should do after a disconnect or link failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The user asked for the disconnect; leave the session down.
    Suppressed,
    /// No target is known; report a terminal error and stop.
    GiveUp,
    /// A precondition is missing; report it and stop without retrying.
    ReportPrecondition(Precondition),
    /// Re-issue a connect to the stored address.
    Retry { address: String },
    /// Retries are exhausted; run a short rescan to refresh the device
    /// list, then return to idle for a manual choice.
    Rescan,
}

/// Recovery rules with a finite, configurable retry bound.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Decide the next step after an unexpected disconnect.
    pub fn decide(
        &self,
        ctx: &ReconnectContext,
        env: Result<(), Precondition>,
    ) -> RecoveryAction {
        if ctx.user_initiated {
            return RecoveryAction::Suppressed;
        }
        let Some(address) = ctx.address.clone() else {
            return RecoveryAction::GiveUp;
        };
        if let Err(missing) = env {
            return RecoveryAction::ReportPrecondition(missing);
        }
        if ctx.attempts_used < self.max_attempts {
            RecoveryAction::Retry { address }
        } else {
            RecoveryAction::Rescan
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

    #[test]
    fn user_disconnect_suppresses_recovery() {
        let ctx = ReconnectContext {
            user_initiated: true,
            ..ReconnectContext::for_target(ADDRESS)
        };
        let policy = ReconnectPolicy::new(1);
        assert_eq!(policy.decide(&ctx, Ok(())), RecoveryAction::Suppressed);
    }

    #[test]
    fn no_target_gives_up() {
        let policy = ReconnectPolicy::new(1);
        assert_eq!(
            policy.decide(&ReconnectContext::default(), Ok(())),
            RecoveryAction::GiveUp
        );
    }

    #[test]
    fn missing_precondition_is_reported_not_retried() {
        let ctx = ReconnectContext::for_target(ADDRESS);
        let policy = ReconnectPolicy::new(1);
        assert_eq!(
            policy.decide(&ctx, Err(Precondition::AdapterDisabled)),
            RecoveryAction::ReportPrecondition(Precondition::AdapterDisabled)
        );
    }

    #[test]
    fn retries_until_the_bound_then_rescans() {
        let policy = ReconnectPolicy::new(1);
        let mut ctx = ReconnectContext::for_target(ADDRESS);

        assert_eq!(
            policy.decide(&ctx, Ok(())),
            RecoveryAction::Retry {
                address: ADDRESS.into()
            }
        );

        ctx.attempts_used = 1;
        assert_eq!(policy.decide(&ctx, Ok(())), RecoveryAction::Rescan);
    }

    #[test]
    fn zero_bound_goes_straight_to_rescan() {
        let policy = ReconnectPolicy::new(0);
        let ctx = ReconnectContext::for_target(ADDRESS);
        assert_eq!(policy.decide(&ctx, Ok(())), RecoveryAction::Rescan);
    }

    #[test]
    fn decision_sequence_is_finite() {
        // However often the link drops, the attempt counter only grows, so
        // after the bound every decision is a rescan.
        let policy = ReconnectPolicy::new(3);
        let mut ctx = ReconnectContext::for_target(ADDRESS);
        let mut retries = 0;
        for _ in 0..10 {
            match policy.decide(&ctx, Ok(())) {
                RecoveryAction::Retry { .. } => {
                    retries += 1;
                    ctx.attempts_used += 1;
                }
                RecoveryAction::Rescan => {}
                other => panic!("unexpected action: {other:?}"),
            }
        }
        assert_eq!(retries, 3);
    }
}
