mod http;
mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use trialwatch_core::models::{Annotation, Study, StudyId, Trial, TrialScope, TrialState};

/// Read/write access to studies, trials and their annotations.
///
/// `write_annotation` is conditional: it must fail with
/// `StoreError::VersionConflict` when the stored version differs from
/// `expected_version`, and never overwrite silently.
#[async_trait]
pub trait TrialStore: Send + Sync {
    async fn list_studies(&self) -> Result<Vec<Study>>;

    async fn list_trials(&self, study: StudyId, scope: TrialScope) -> Result<Vec<Trial>>;

    /// Current note of `trial`. A store may answer the first read after
    /// `list_trials` from that listing; later reads must be fresh.
    async fn get_annotation(&self, trial: &Trial) -> Result<Annotation>;

    /// Returns the new version on success.
    async fn write_annotation(&self, trial: &Trial, body: &str, expected_version: u64)
        -> Result<u64>;

    async fn set_state(&self, trial: &Trial, state: TrialState) -> Result<()>;
}
