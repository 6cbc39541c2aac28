//! Phase plans and weighted progress.
//!
//! Every migration mode owns a static plan of (phase, weight) pairs whose
//! weights sum to 100. The tracker credits completed phases in full, scales
//! the current phase by its local percent, and holds the overall figure
//! below 100 until the run is finished. Phases outside the active plan
//! carry weight zero, so a flow may narrate extra stages without moving
//! the number.

use super::MigrationMode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationPhase {
    Initializing,
    Discovering,
    Connecting,
    BackingUp,
    Extracting,
    StoppingTarget,
    Transferring,
    Restoring,
    RemappingPaths,
    UpdatingPreferences,
    Verifying,
    StartingTarget,
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MigrationPhase::Initializing => "INITIALIZING",
            MigrationPhase::Discovering => "DISCOVERING",
            MigrationPhase::Connecting => "CONNECTING",
            MigrationPhase::BackingUp => "BACKING_UP",
            MigrationPhase::Extracting => "EXTRACTING",
            MigrationPhase::StoppingTarget => "STOPPING_TARGET",
            MigrationPhase::Transferring => "TRANSFERRING",
            MigrationPhase::Restoring => "RESTORING",
            MigrationPhase::RemappingPaths => "REMAPPING_PATHS",
            MigrationPhase::UpdatingPreferences => "UPDATING_PREFERENCES",
            MigrationPhase::Verifying => "VERIFYING",
            MigrationPhase::StartingTarget => "STARTING_TARGET",
        };
        f.write_str(label)
    }
}

/// Wall-clock time one phase took, kept in the final result.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub phase: MigrationPhase,
    pub seconds: f64,
}

const LOCAL_BACKUP_PLAN: &[(MigrationPhase, f64)] = &[
    (MigrationPhase::Initializing, 5.0),
    (MigrationPhase::BackingUp, 75.0),
    (MigrationPhase::UpdatingPreferences, 10.0),
    (MigrationPhase::Verifying, 10.0),
];

const LOCAL_RESTORE_PLAN: &[(MigrationPhase, f64)] = &[
    (MigrationPhase::Initializing, 5.0),
    (MigrationPhase::Extracting, 15.0),
    (MigrationPhase::StoppingTarget, 5.0),
    (MigrationPhase::Restoring, 50.0),
    (MigrationPhase::RemappingPaths, 10.0),
    (MigrationPhase::UpdatingPreferences, 5.0),
    (MigrationPhase::StartingTarget, 10.0),
];

const NETWORK_PUSH_PLAN: &[(MigrationPhase, f64)] = &[
    (MigrationPhase::Initializing, 5.0),
    (MigrationPhase::BackingUp, 45.0),
    (MigrationPhase::UpdatingPreferences, 5.0),
    (MigrationPhase::Verifying, 5.0),
    (MigrationPhase::Connecting, 5.0),
    (MigrationPhase::Transferring, 35.0),
];

const NETWORK_PULL_PLAN: &[(MigrationPhase, f64)] = &[
    (MigrationPhase::Discovering, 20.0),
    (MigrationPhase::Connecting, 10.0),
    (MigrationPhase::Transferring, 70.0),
];

const FULL_MIGRATION_PLAN: &[(MigrationPhase, f64)] = &[
    (MigrationPhase::Initializing, 5.0),
    (MigrationPhase::BackingUp, 30.0),
    (MigrationPhase::UpdatingPreferences, 5.0),
    (MigrationPhase::Verifying, 5.0),
    (MigrationPhase::Connecting, 5.0),
    (MigrationPhase::Transferring, 30.0),
    (MigrationPhase::Restoring, 20.0),
];

pub(crate) fn plan_for(mode: MigrationMode) -> &'static [(MigrationPhase, f64)] {
    match mode {
        MigrationMode::LocalBackup => LOCAL_BACKUP_PLAN,
        MigrationMode::LocalRestore => LOCAL_RESTORE_PLAN,
        MigrationMode::NetworkPush => NETWORK_PUSH_PLAN,
        MigrationMode::NetworkPull => NETWORK_PULL_PLAN,
        MigrationMode::FullMigration => FULL_MIGRATION_PLAN,
    }
}

/// Tracks phase transitions for one run and folds them into a single
/// monotonic percentage.
pub(crate) struct PhaseTracker {
    plan: &'static [(MigrationPhase, f64)],
    done: Vec<MigrationPhase>,
    current: Option<(MigrationPhase, f64)>,
    finished: bool,
    timeline: Vec<(MigrationPhase, Instant, Option<Duration>)>,
}

impl PhaseTracker {
    pub fn new(mode: MigrationMode) -> Self {
        PhaseTracker {
            plan: plan_for(mode),
            done: Vec::new(),
            current: None,
            finished: false,
            timeline: Vec::new(),
        }
    }

    fn weight_of(&self, phase: MigrationPhase) -> f64 {
        self.plan
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, w)| *w)
            .unwrap_or(0.0)
    }

    fn credit(&mut self, phase: MigrationPhase) {
        if !self.done.contains(&phase) {
            self.done.push(phase);
        }
    }

    fn close_timing(&mut self, phase: MigrationPhase) {
        if let Some(entry) = self
            .timeline
            .iter_mut()
            .rev()
            .find(|(p, _, ended)| *p == phase && ended.is_none())
        {
            entry.2 = Some(entry.1.elapsed());
        }
    }

    /// Move into `phase`, crediting whatever phase was running before.
    pub fn enter(&mut self, phase: MigrationPhase) {
        if let Some((previous, _)) = self.current.take() {
            self.credit(previous);
            self.close_timing(previous);
        }
        self.current = Some((phase, 0.0));
        self.timeline.push((phase, Instant::now(), None));
    }

    /// Credit a phase that will not run this time (e.g. EXTRACTING when the
    /// source is already a directory).
    pub fn skip(&mut self, phase: MigrationPhase) {
        self.credit(phase);
        self.timeline
            .push((phase, Instant::now(), Some(Duration::ZERO)));
    }

    /// Report progress within the current phase. Regressions are ignored so
    /// the overall figure never moves backwards.
    pub fn update(&mut self, percent: f64) {
        if let Some((_, current)) = &mut self.current {
            let bounded = percent.clamp(0.0, 100.0);
            if bounded > *current {
                *current = bounded;
            }
        }
    }

    /// Mark the run complete; from here `overall_percent` reports 100.
    pub fn finish(&mut self) {
        if let Some((phase, _)) = self.current.take() {
            self.credit(phase);
            self.close_timing(phase);
        }
        self.finished = true;
    }

    pub fn current_phase(&self) -> Option<MigrationPhase> {
        self.current.as_ref().map(|(phase, _)| *phase)
    }

    pub fn phase_percent(&self) -> f64 {
        self.current.as_ref().map(|(_, pct)| *pct).unwrap_or(0.0)
    }

    /// Share of the overall percentage the current phase spans. Lets a
    /// long-running phase publish intermediate overall figures without
    /// re-entering the tracker on every chunk.
    pub fn current_span(&self) -> f64 {
        let total: f64 = self.plan.iter().map(|(_, w)| w).sum();
        match &self.current {
            Some((phase, _)) if total > 0.0 => self.weight_of(*phase) / total * 100.0,
            _ => 0.0,
        }
    }

    pub fn overall_percent(&self) -> f64 {
        if self.finished {
            return 100.0;
        }
        let total: f64 = self.plan.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let mut earned: f64 = self.done.iter().map(|p| self.weight_of(*p)).sum();
        if let Some((phase, pct)) = &self.current {
            earned += self.weight_of(*phase) * pct / 100.0;
        }
        (earned / total * 100.0).min(99.9)
    }

    /// Per-phase wall-clock timings in the order the phases ran. A phase
    /// still open (failure mid-phase) reports its elapsed time so far.
    pub fn timings(&self) -> Vec<PhaseTiming> {
        self.timeline
            .iter()
            .map(|(phase, started, ended)| PhaseTiming {
                phase: *phase,
                seconds: ended.unwrap_or_else(|| started.elapsed()).as_secs_f64(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close_to(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() < 1e-9
    }

    #[test]
    fn test_every_plan_sums_to_one_hundred() {
        for mode in [
            MigrationMode::LocalBackup,
            MigrationMode::LocalRestore,
            MigrationMode::NetworkPush,
            MigrationMode::NetworkPull,
            MigrationMode::FullMigration,
        ] {
            let total: f64 = plan_for(mode).iter().map(|(_, w)| w).sum();
            assert!(close_to(total, 100.0), "{mode} plan sums to {total}");
        }
    }

    #[test]
    fn test_weighted_percent() {
        let mut tracker = PhaseTracker::new(MigrationMode::LocalRestore);
        tracker.enter(MigrationPhase::Initializing);
        tracker.update(100.0);
        assert!(close_to(tracker.overall_percent(), 5.0));

        tracker.enter(MigrationPhase::Extracting);
        tracker.update(50.0);
        // 5 complete + half of 15
        assert!(close_to(tracker.overall_percent(), 12.5));
        assert_eq!(tracker.current_phase(), Some(MigrationPhase::Extracting));
        assert!(close_to(tracker.phase_percent(), 50.0));
    }

    #[test]
    fn test_update_never_regresses() {
        let mut tracker = PhaseTracker::new(MigrationMode::LocalBackup);
        tracker.enter(MigrationPhase::BackingUp);
        tracker.update(80.0);
        let high = tracker.overall_percent();
        tracker.update(30.0);
        assert!(close_to(tracker.overall_percent(), high));
        tracker.update(250.0);
        assert!(close_to(tracker.phase_percent(), 100.0));
    }

    #[test]
    fn test_skip_credits_full_weight() {
        let mut tracker = PhaseTracker::new(MigrationMode::LocalRestore);
        tracker.enter(MigrationPhase::Initializing);
        tracker.skip(MigrationPhase::Extracting);
        // 15 skipped, INITIALIZING still open at 0
        assert!(close_to(tracker.overall_percent(), 15.0));
    }

    #[test]
    fn test_caps_below_one_hundred_until_finished() {
        let mut tracker = PhaseTracker::new(MigrationMode::NetworkPull);
        tracker.enter(MigrationPhase::Discovering);
        tracker.update(100.0);
        tracker.enter(MigrationPhase::Connecting);
        tracker.update(100.0);
        tracker.enter(MigrationPhase::Transferring);
        tracker.update(100.0);
        assert!(close_to(tracker.overall_percent(), 99.9));

        tracker.finish();
        assert!(close_to(tracker.overall_percent(), 100.0));
    }

    #[test]
    fn test_current_span_matches_phase_weight() {
        let mut tracker = PhaseTracker::new(MigrationMode::NetworkPull);
        assert!(close_to(tracker.current_span(), 0.0));
        tracker.enter(MigrationPhase::Transferring);
        assert!(close_to(tracker.current_span(), 70.0));
        tracker.enter(MigrationPhase::StoppingTarget);
        assert!(close_to(tracker.current_span(), 0.0));
    }

    #[test]
    fn test_unlisted_phase_has_no_weight() {
        let mut tracker = PhaseTracker::new(MigrationMode::NetworkPull);
        tracker.enter(MigrationPhase::Discovering);
        tracker.update(100.0);
        tracker.enter(MigrationPhase::StoppingTarget);
        tracker.update(100.0);
        // DISCOVERING credited, STOPPING_TARGET contributes nothing
        assert!(close_to(tracker.overall_percent(), 20.0));
    }

    #[test]
    fn test_timings_cover_entered_and_skipped_phases() {
        let mut tracker = PhaseTracker::new(MigrationMode::LocalRestore);
        tracker.enter(MigrationPhase::Initializing);
        tracker.skip(MigrationPhase::Extracting);
        tracker.enter(MigrationPhase::Restoring);
        tracker.finish();

        let timings = tracker.timings();
        let phases: Vec<MigrationPhase> = timings.iter().map(|t| t.phase).collect();
        assert_eq!(
            phases,
            vec![
                MigrationPhase::Initializing,
                MigrationPhase::Extracting,
                MigrationPhase::Restoring,
            ]
        );
        assert!(close_to(timings[1].seconds, 0.0));
    }

    #[test]
    fn test_phase_serializes_screaming_snake() {
        let json = serde_json::to_string(&MigrationPhase::UpdatingPreferences).unwrap();
        assert_eq!(json, "\"UPDATING_PREFERENCES\"");
        assert_eq!(MigrationPhase::BackingUp.to_string(), "BACKING_UP");
    }
}
