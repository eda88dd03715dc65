use super::TrialStore;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use trialwatch_core::models::{Annotation, Study, StudyId, Trial, TrialId, TrialScope, TrialState};

#[derive(Default)]
struct Inner {
    studies: Vec<Study>,
    trials: BTreeMap<TrialId, (Trial, Annotation)>,
    next_trial_id: u64,
    annotation_writes: usize,
    state_writes: usize,
    /// Pending foreign writes per trial, applied right after a read.
    foreign_writes: HashMap<TrialId, usize>,
    failing_calls: usize,
}

impl Inner {
    fn check_available(&mut self) -> Result<()> {
        if self.failing_calls > 0 {
            self.failing_calls -= 1;
            return Err(StoreError::Unreachable("injected failure".into()));
        }
        Ok(())
    }

    fn entry_mut(&mut self, id: TrialId) -> Result<&mut (Trial, Annotation)> {
        self.trials
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("trial {}", id)))
    }
}

/// In-process trial store. Counts write calls and can simulate concurrent
/// annotation writers and outages.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_study(&self, name: &str) -> StudyId {
        let mut inner = self.inner.lock();
        let id = StudyId(inner.studies.len() as u64 + 1);
        inner.studies.push(Study {
            id,
            name: name.to_string(),
        });
        id
    }

    pub fn add_trial(&self, study: StudyId, state: TrialState, note: &str) -> Trial {
        self.add_trial_raw(study, state.as_str(), note)
    }

    /// Add a trial whose state string is stored verbatim.
    pub fn add_trial_raw(&self, study: StudyId, raw_state: &str, note: &str) -> Trial {
        let mut inner = self.inner.lock();
        inner.next_trial_id += 1;
        let id = TrialId(inner.next_trial_id);
        let number = inner
            .trials
            .values()
            .filter(|(t, _)| t.study_id == study)
            .count() as u64;
        let trial = Trial {
            id,
            study_id: study,
            number,
            raw_state: raw_state.to_string(),
        };
        inner
            .trials
            .insert(id, (trial.clone(), Annotation::new(note, 0)));
        trial
    }

    /// Overwrite a note as an outside writer would.
    pub fn edit_note(&self, trial: TrialId, body: &str) {
        let mut inner = self.inner.lock();
        if let Some((_, annotation)) = inner.trials.get_mut(&trial) {
            annotation.body = body.to_string();
            annotation.version += 1;
        }
    }

    /// Make another writer bump the trial's annotation version right after
    /// each of its next `count` reads.
    pub fn inject_foreign_writes(&self, trial: TrialId, count: usize) {
        self.inner.lock().foreign_writes.insert(trial, count);
    }

    /// Fail the next `count` calls with `StoreError::Unreachable`.
    pub fn fail_next_calls(&self, count: usize) {
        self.inner.lock().failing_calls = count;
    }

    pub fn state_of(&self, trial: TrialId) -> Option<String> {
        self.inner
            .lock()
            .trials
            .get(&trial)
            .map(|(t, _)| t.raw_state.clone())
    }

    pub fn annotation_of(&self, trial: TrialId) -> Option<Annotation> {
        self.inner.lock().trials.get(&trial).map(|(_, a)| a.clone())
    }

    /// Total conditional annotation writes and state changes.
    pub fn write_calls(&self) -> usize {
        let inner = self.inner.lock();
        inner.annotation_writes + inner.state_writes
    }

    pub fn state_writes(&self) -> usize {
        self.inner.lock().state_writes
    }
}

#[async_trait]
impl TrialStore for MemoryStore {
    async fn list_studies(&self) -> Result<Vec<Study>> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.studies.clone())
    }

    async fn list_trials(&self, study: StudyId, scope: TrialScope) -> Result<Vec<Trial>> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner
            .trials
            .values()
            .filter(|(t, _)| t.study_id == study && scope.includes(&t.raw_state))
            .map(|(t, _)| t.clone())
            .collect())
    }

    async fn get_annotation(&self, trial: &Trial) -> Result<Annotation> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        let bump = match inner.foreign_writes.get_mut(&trial.id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        let (_, annotation) = inner.entry_mut(trial.id)?;
        let snapshot = annotation.clone();
        if bump {
            annotation.version += 1;
        }
        Ok(snapshot)
    }

    async fn write_annotation(
        &self,
        trial: &Trial,
        body: &str,
        expected_version: u64,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.annotation_writes += 1;
        let (_, annotation) = inner.entry_mut(trial.id)?;
        if annotation.version != expected_version {
            return Err(StoreError::VersionConflict {
                trial: trial.id,
                expected: expected_version,
            });
        }
        annotation.body = body.to_string();
        annotation.version += 1;
        Ok(annotation.version)
    }

    async fn set_state(&self, trial: &Trial, state: TrialState) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.state_writes += 1;
        let (stored, _) = inner.entry_mut(trial.id)?;
        stored.raw_state = state.as_str().to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let store = MemoryStore::new();
        let study = store.add_study("s");
        let trial = store.add_trial(study, TrialState::Running, "hello");

        assert_eq!(store.write_annotation(&trial, "a", 0).await.unwrap(), 1);
        let stale = store.write_annotation(&trial, "b", 0).await;
        assert!(matches!(stale, Err(StoreError::VersionConflict { .. })));
        assert_eq!(store.annotation_of(trial.id).unwrap(), Annotation::new("a", 1));
    }

    #[tokio::test]
    async fn test_foreign_write_follows_read() {
        let store = MemoryStore::new();
        let study = store.add_study("s");
        let trial = store.add_trial(study, TrialState::Running, "PRUNE");
        store.inject_foreign_writes(trial.id, 1);

        assert_eq!(store.get_annotation(&trial).await.unwrap().version, 0);
        assert_eq!(store.get_annotation(&trial).await.unwrap().version, 1);
        assert_eq!(store.get_annotation(&trial).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_injected_outage() {
        let store = MemoryStore::new();
        store.add_study("s");
        store.fail_next_calls(1);
        assert!(store.list_studies().await.unwrap_err().is_transient());
        assert_eq!(store.list_studies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scope_filtering() {
        let store = MemoryStore::new();
        let study = store.add_study("s");
        store.add_trial(study, TrialState::Running, "");
        store.add_trial(study, TrialState::Complete, "");
        store.add_trial_raw(study, "Exploded", "");

        let active = store.list_trials(study, TrialScope::ActiveOnly).await.unwrap();
        assert_eq!(active.len(), 2);
        let all = store.list_trials(study, TrialScope::AllTrials).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
