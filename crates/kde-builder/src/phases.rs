//! Ordered list of build phases assigned to each project.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Update,
    Build,
    Test,
    Install,
    Uninstall,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Update => "update",
            Phase::Build => "build",
            Phase::Test => "test",
            Phase::Install => "install",
            Phase::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The phases a project will run, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseList {
    phases: Vec<Phase>,
}

impl Default for PhaseList {
    fn default() -> Self {
        PhaseList {
            phases: vec![Phase::Update, Phase::Build, Phase::Install],
        }
    }
}

impl PhaseList {
    pub fn new(phases: Vec<Phase>) -> Self {
        PhaseList { phases }
    }

    pub fn has(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    pub fn filter_out(&mut self, phase: Phase) {
        self.phases.retain(|p| *p != phase);
    }

    /// Insert `test` after `build` when requested. Appending would run the
    /// suite after install, which is not what `run-tests` means.
    pub fn add_test_after_build(&mut self) {
        if self.has(Phase::Test) {
            return;
        }
        let at = self
            .phases
            .iter()
            .position(|p| *p == Phase::Build)
            .map(|i| i + 1)
            .unwrap_or(self.phases.len());
        self.phases.insert(at, Phase::Test);
    }

    pub fn reset_to(&mut self, phases: Vec<Phase>) {
        self.phases = phases;
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Phase> + '_ {
        self.phases.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_update_build_install() {
        let phases = PhaseList::default();
        let list: Vec<Phase> = phases.iter().collect();
        assert_eq!(list, vec![Phase::Update, Phase::Build, Phase::Install]);
    }

    #[test]
    fn filter_out_removes_only_named_phase() {
        let mut phases = PhaseList::default();
        phases.filter_out(Phase::Update);
        assert!(!phases.has(Phase::Update));
        assert!(phases.has(Phase::Build));
        assert!(phases.has(Phase::Install));
    }

    #[test]
    fn test_phase_lands_between_build_and_install() {
        let mut phases = PhaseList::default();
        phases.add_test_after_build();
        let list: Vec<Phase> = phases.iter().collect();
        assert_eq!(
            list,
            vec![Phase::Update, Phase::Build, Phase::Test, Phase::Install]
        );
        // Idempotent.
        phases.add_test_after_build();
        assert_eq!(phases.iter().count(), 4);
    }
}
