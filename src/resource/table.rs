//! Per-kind transition tables
//!
//! Tables are plain data: the executor never branches on the kind, it only
//! looks up the edge for the record's (desired, phase) pair.

use super::{Action, DesiredState, Phase};

/// One edge of a state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionRule {
    pub desired: DesiredState,
    pub from: Phase,
    pub action: Action,
    /// Phase written when the driver reports success
    pub to: Phase,
}

const fn rule(desired: DesiredState, from: Phase, action: Action, to: Phase) -> TransitionRule {
    TransitionRule {
        desired,
        from,
        action,
        to,
    }
}

/// State machine for one family of resource kinds
#[derive(Debug)]
pub struct TransitionTable {
    pub name: &'static str,
    /// (desired, phase) for a freshly created record
    pub initial: (DesiredState, Phase),
    /// Phase written on a fatal outcome
    pub failed: Phase,
    /// Terminal projection of each supported desired state
    pub converged: &'static [(DesiredState, Phase)],
    pub rules: &'static [TransitionRule],
}

impl TransitionTable {
    pub fn lookup(&self, desired: DesiredState, phase: Phase) -> Option<&'static TransitionRule> {
        self.rules
            .iter()
            .find(|r| r.desired == desired && r.from == phase)
    }

    pub fn converged_phase(&self, desired: DesiredState) -> Option<Phase> {
        self.converged
            .iter()
            .find(|(d, _)| *d == desired)
            .map(|(_, p)| *p)
    }

    pub fn supports(&self, desired: DesiredState) -> bool {
        self.converged_phase(desired).is_some()
    }
}

use Action::*;
use DesiredState::{Active, Deleted, Running, Stopped};
use Phase::{Created, Creating, Deleting, Failed, Started, Starting, Stopping};

/// Create-once resources: storage, databases, domains, triggers, billing records
pub static PROVISIONED: TransitionTable = TransitionTable {
    name: "provisioned",
    initial: (Active, Creating),
    failed: Failed,
    converged: &[(Active, Created), (Deleted, Phase::Deleted)],
    rules: &[
        rule(Active, Creating, Provision, Created),
        rule(Deleted, Creating, BeginTeardown, Deleting),
        rule(Deleted, Created, BeginTeardown, Deleting),
        rule(Deleted, Failed, BeginTeardown, Deleting),
        rule(Deleted, Deleting, Teardown, Phase::Deleted),
    ],
};

/// Long-running workloads that can be started and stopped
pub static WORKLOAD: TransitionTable = TransitionTable {
    name: "workload",
    initial: (Running, Creating),
    failed: Failed,
    converged: &[
        (Running, Started),
        (Stopped, Phase::Stopped),
        (Deleted, Phase::Deleted),
    ],
    rules: &[
        rule(Running, Creating, Provision, Created),
        rule(Running, Created, BeginStart, Starting),
        rule(Running, Phase::Stopped, BeginStart, Starting),
        rule(Running, Stopping, BeginStart, Starting),
        rule(Running, Starting, Start, Started),
        rule(Stopped, Creating, Provision, Created),
        rule(Stopped, Created, BeginStop, Stopping),
        rule(Stopped, Started, BeginStop, Stopping),
        rule(Stopped, Starting, BeginStop, Stopping),
        rule(Stopped, Stopping, Stop, Phase::Stopped),
        rule(Deleted, Creating, BeginTeardown, Deleting),
        rule(Deleted, Created, BeginTeardown, Deleting),
        rule(Deleted, Starting, BeginTeardown, Deleting),
        rule(Deleted, Started, BeginTeardown, Deleting),
        rule(Deleted, Stopping, BeginTeardown, Deleting),
        rule(Deleted, Phase::Stopped, BeginTeardown, Deleting),
        rule(Deleted, Failed, BeginTeardown, Deleting),
        rule(Deleted, Deleting, Teardown, Phase::Deleted),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tables() -> [&'static TransitionTable; 2] {
        [&PROVISIONED, &WORKLOAD]
    }

    #[test]
    fn converged_pairs_have_no_outgoing_edge() {
        for table in all_tables() {
            for (desired, phase) in table.converged {
                assert!(
                    table.lookup(*desired, *phase).is_none(),
                    "{}: converged pair {desired}/{phase} still has an edge",
                    table.name
                );
            }
        }
    }

    #[test]
    fn stable_phases_only_lead_into_in_progress_phases() {
        for table in all_tables() {
            for r in table.rules {
                if !r.from.is_in_progress() {
                    assert!(
                        r.to.is_in_progress(),
                        "{}: {}/{} skips straight to {}",
                        table.name,
                        r.desired,
                        r.from,
                        r.to
                    );
                }
            }
        }
    }

    #[test]
    fn deletion_never_leads_back_to_a_live_phase() {
        for table in all_tables() {
            for r in table.rules.iter().filter(|r| r.desired == Deleted) {
                assert!(matches!(r.to, Deleting | Phase::Deleted), "{}: {r:?}", table.name);
            }
        }
    }

    #[test]
    fn every_pair_is_deterministic() {
        for table in all_tables() {
            for r in table.rules {
                let matching = table
                    .rules
                    .iter()
                    .filter(|o| o.desired == r.desired && o.from == r.from)
                    .count();
                assert_eq!(matching, 1, "{}: duplicate edge for {r:?}", table.name);
            }
        }
    }

    #[test]
    fn every_supported_state_reaches_its_projection() {
        // Following success edges from the initial phase must terminate in the
        // converged phase for every desired state the table supports.
        for table in all_tables() {
            for (desired, target) in table.converged {
                let mut phase = table.initial.1;
                let mut steps = 0;
                while let Some(r) = table.lookup(*desired, phase) {
                    phase = r.to;
                    steps += 1;
                    assert!(steps < 10, "{}: {desired} loops", table.name);
                }
                assert_eq!(phase, *target, "{}: {desired}", table.name);
            }
        }
    }

    #[test]
    fn failed_records_wait_unless_deleted() {
        assert!(PROVISIONED.lookup(Active, Failed).is_none());
        assert!(WORKLOAD.lookup(Running, Failed).is_none());
        assert_eq!(
            WORKLOAD.lookup(Deleted, Failed).map(|r| r.action),
            Some(BeginTeardown)
        );
    }
}
