use crate::error::{Result, StoreError};
use crate::store::TrialStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use trialwatch_core::models::{
    Annotation, MonitorConfig, Study, StudySelector, Trial, TrialId, TrialScope, TrialState,
};

const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const FAILURE_PAUSE_FACTOR: u32 = 10;
const STUDY_LOOKUP_ATTEMPTS: u32 = 3;
const STUDY_LOOKUP_BACKOFF: Duration = Duration::from_secs(2);
const HANDLED_MARKER: &str = "[trialwatch]";

/// What one poll cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: usize,
    pub transitioned: Vec<(TrialId, TrialState)>,
    /// Transitions a dry run would have made.
    pub planned: Vec<(TrialId, TrialState)>,
    pub retries: usize,
    /// Trials skipped after a second version conflict.
    pub conflicts: usize,
    pub malformed: usize,
    pub failed: usize,
}

/// Polls trial annotations and turns matching commands into state changes.
pub struct Monitor {
    store: Arc<dyn TrialStore>,
    config: MonitorConfig,
    /// Last annotation version acted upon, per trial.
    handled: HashMap<TrialId, u64>,
    studies: Option<Vec<Study>>,
    consecutive_failures: u32,
}

impl Monitor {
    pub fn new(store: Arc<dyn TrialStore>, config: MonitorConfig) -> Self {
        Self {
            store,
            config,
            handled: HashMap::new(),
            studies: None,
            consecutive_failures: 0,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Poll until `shutdown` turns true or its sender is dropped. Shutdown
    /// only interrupts the sleep between cycles, never a cycle in flight.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.config.studies.is_empty() {
            info!("No studies selected, monitor is idle. Use --study <name> or --study all");
            wait_for_shutdown(&mut shutdown).await;
            return;
        }

        info!(
            "Monitoring annotations every {:?} with rules {}{}",
            self.config.interval,
            self.config.rules.describe(),
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        if self.wait_for_studies(&mut shutdown).await {
            loop {
                let pause = self.cycle_and_pause().await;
                if sleep_or_shutdown(pause, &mut shutdown).await {
                    break;
                }
            }
        }

        info!("Monitor stopped");
    }

    /// Run one cycle and decide how long to sleep afterwards.
    async fn cycle_and_pause(&mut self) -> Duration {
        match self.run_cycle().await {
            Ok(report) => {
                self.consecutive_failures = 0;
                debug!(
                    "Cycle done: {} scanned, {} transitioned, {} planned, {} conflicts",
                    report.scanned,
                    report.transitioned.len(),
                    report.planned.len(),
                    report.conflicts
                );
                self.config.interval
            }
            Err(e) => {
                self.consecutive_failures += 1;
                debug!(
                    "Poll cycle abandoned ({} in a row): {}",
                    self.consecutive_failures, e
                );
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    let pause = self.config.interval.saturating_mul(FAILURE_PAUSE_FACTOR);
                    warn!(
                        "{} consecutive failures, pausing for {:?}",
                        self.consecutive_failures, pause
                    );
                    self.consecutive_failures = 0;
                    self.studies = None;
                    pause
                } else {
                    self.config.interval
                }
            }
        }
    }

    /// Execute one poll cycle over every selected study.
    ///
    /// A transient store error abandons the cycle and is returned; any other
    /// error only affects the trial it occurred on.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let studies = self.selected_studies().await?;
        let mut report = CycleReport::default();

        for study in &studies {
            let trials = self.store.list_trials(study.id, self.config.scope).await?;
            for trial in trials {
                report.scanned += 1;
                match self.process_trial(study, &trial, &mut report).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        report.failed += 1;
                        error!("Trial #{} in '{}': {}", trial.number, study.name, e);
                    }
                }
            }
        }

        Ok(report)
    }

    async fn process_trial(
        &mut self,
        study: &Study,
        trial: &Trial,
        report: &mut CycleReport,
    ) -> Result<()> {
        let current = match trial.state() {
            Ok(state) => state,
            Err(_) => {
                let err = StoreError::MalformedState {
                    trial: trial.id,
                    state: trial.raw_state.clone(),
                };
                warn!("Skipping trial #{} in '{}': {}", trial.number, study.name, err);
                report.malformed += 1;
                return Ok(());
            }
        };

        if self.config.scope == TrialScope::ActiveOnly && current.is_terminal() {
            return Ok(());
        }

        for attempt in 0..2 {
            let annotation = self.store.get_annotation(trial).await?;
            let (target, pattern) = match self.config.rules.first_match(&annotation.body) {
                Some(rule) => (rule.target, rule.pattern.clone()),
                None => return Ok(()),
            };

            if self.handled.get(&trial.id) == Some(&annotation.version) {
                return Ok(());
            }

            if current == target {
                debug!(
                    "Trial #{} in '{}' already {}",
                    trial.number, study.name, target
                );
                self.handled.insert(trial.id, annotation.version);
                return Ok(());
            }

            if self.config.dry_run {
                info!(
                    "DRY RUN: would move trial #{} in '{}' from {} to {} (matched '{}' in note: {})",
                    trial.number,
                    study.name,
                    current,
                    target,
                    pattern,
                    annotation.preview()
                );
                report.planned.push((trial.id, target));
                self.handled.insert(trial.id, annotation.version);
                return Ok(());
            }

            match self.transition(trial, &annotation, target).await {
                Ok(version) => {
                    info!(
                        "Trial #{} in '{}': {} -> {} (matched '{}' in note: {})",
                        trial.number,
                        study.name,
                        current,
                        target,
                        pattern,
                        annotation.preview()
                    );
                    report.transitioned.push((trial.id, target));
                    self.handled.insert(trial.id, version);
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) if attempt == 0 => {
                    debug!(
                        "Note of trial #{} changed while processing, retrying",
                        trial.number
                    );
                    report.retries += 1;
                }
                Err(StoreError::VersionConflict { expected, .. }) => {
                    debug!(
                        "Note of trial #{} in '{}' changed again (expected version {}), skipping this cycle",
                        trial.number, study.name, expected
                    );
                    report.conflicts += 1;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Apply `target`, guarded by the annotation version that was read.
    /// Returns the annotation version the transition corresponds to.
    async fn transition(
        &self,
        trial: &Trial,
        annotation: &Annotation,
        target: TrialState,
    ) -> Result<u64> {
        let version = if self.config.mark_handled {
            let body = format!("{}\n{} {} applied", annotation.body, HANDLED_MARKER, target);
            self.store
                .write_annotation(trial, &body, annotation.version)
                .await?
        } else {
            let latest = self.store.get_annotation(trial).await?;
            if latest.version != annotation.version {
                return Err(StoreError::VersionConflict {
                    trial: trial.id,
                    expected: annotation.version,
                });
            }
            annotation.version
        };

        self.store.set_state(trial, target).await?;
        Ok(version)
    }

    /// Selected studies, cached once every named study has been found.
    async fn selected_studies(&mut self) -> Result<Vec<Study>> {
        if let Some(cached) = &self.studies {
            return Ok(cached.clone());
        }

        let (found, missing) = self.lookup_studies().await?;
        if missing.is_empty() {
            self.studies = Some(found.clone());
        } else {
            debug!("Studies not found yet: {}", missing.join(", "));
        }
        Ok(found)
    }

    async fn lookup_studies(&self) -> Result<(Vec<Study>, Vec<String>)> {
        let all = self.store.list_studies().await?;
        let missing = match &self.config.studies {
            StudySelector::Named(names) => names
                .iter()
                .filter(|n| !all.iter().any(|s| &s.name == *n))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        let found = all
            .into_iter()
            .filter(|s| self.config.studies.matches(s))
            .collect();
        Ok((found, missing))
    }

    /// Look up named studies with exponential backoff before the first cycle.
    /// Returns false if shutdown was requested while waiting.
    async fn wait_for_studies(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if !matches!(self.config.studies, StudySelector::Named(_)) {
            return true;
        }

        let mut backoff = STUDY_LOOKUP_BACKOFF;
        for attempt in 1..=STUDY_LOOKUP_ATTEMPTS {
            match self.lookup_studies().await {
                Ok((found, missing)) if missing.is_empty() => {
                    info!(
                        "Found studies: {}",
                        found
                            .iter()
                            .map(|s| s.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    self.studies = Some(found);
                    return true;
                }
                Ok((_, missing)) if attempt == STUDY_LOOKUP_ATTEMPTS => {
                    warn!(
                        "Studies not found: {}. Will keep looking every cycle",
                        missing.join(", ")
                    );
                    return true;
                }
                Ok((_, missing)) => {
                    info!(
                        "Waiting for studies {} (attempt {}/{})",
                        missing.join(", "),
                        attempt,
                        STUDY_LOOKUP_ATTEMPTS
                    );
                }
                Err(e) => debug!("Study lookup failed: {}", e),
            }

            if attempt < STUDY_LOOKUP_ATTEMPTS {
                if sleep_or_shutdown(backoff, shutdown).await {
                    return false;
                }
                backoff *= 2;
            }
        }
        true
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `duration`; returns true if shutdown was requested meanwhile.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow_and_update() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
