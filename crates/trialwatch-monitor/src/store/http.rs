use super::TrialStore;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use trialwatch_core::models::{Annotation, Study, StudyId, Trial, TrialId, TrialScope, TrialState};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct StudySummaries {
    study_summaries: Vec<StudySummary>,
}

#[derive(Deserialize)]
struct StudySummary {
    study_id: u64,
    study_name: String,
}

#[derive(Deserialize)]
struct StudyDetail {
    trials: Vec<TrialDetail>,
}

#[derive(Deserialize)]
struct TrialDetail {
    trial_id: u64,
    number: u64,
    state: String,
    #[serde(default)]
    note: Option<NoteBody>,
}

#[derive(Serialize, Deserialize)]
struct NoteBody {
    version: u64,
    body: String,
}

#[derive(Serialize)]
struct TellBody<'a> {
    state: &'a str,
}

/// Trial store backed by the dashboard's REST API.
///
/// The study endpoint returns every trial with its note, so `list_trials`
/// keeps the notes it saw. The first `get_annotation` of a listed trial is
/// answered from there; any later read goes back to the dashboard.
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    listed_notes: Mutex<HashMap<TrialId, Annotation>>,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Unreachable(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            listed_notes: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn study_detail(&self, study: StudyId) -> Result<StudyDetail> {
        let resp = self
            .client
            .get(self.url(&format!("/api/studies/{}", study)))
            .query(&[("after", "0")])
            .send()
            .await?;
        let resp = check_status(resp, &format!("study {}", study))?;
        Ok(resp.json().await?)
    }
}

fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status == StatusCode::NOT_FOUND {
        Err(StoreError::NotFound(what.to_string()))
    } else if status.is_server_error() {
        Err(StoreError::Unreachable(format!("{} returned {}", what, status)))
    } else {
        Err(StoreError::UnexpectedResponse(format!("{} returned {}", what, status)))
    }
}

#[async_trait]
impl TrialStore for HttpStore {
    async fn list_studies(&self) -> Result<Vec<Study>> {
        let resp = self.client.get(self.url("/api/studies")).send().await?;
        let summaries: StudySummaries = check_status(resp, "study list")?.json().await?;
        Ok(summaries
            .study_summaries
            .into_iter()
            .map(|s| Study {
                id: StudyId(s.study_id),
                name: s.study_name,
            })
            .collect())
    }

    async fn list_trials(&self, study: StudyId, scope: TrialScope) -> Result<Vec<Trial>> {
        let detail = self.study_detail(study).await?;
        let mut notes = self.listed_notes.lock();
        Ok(detail
            .trials
            .into_iter()
            .filter(|t| scope.includes(&t.state))
            .map(|t| {
                let id = TrialId(t.trial_id);
                let note = t
                    .note
                    .map(|n| Annotation::new(n.body, n.version))
                    .unwrap_or_default();
                notes.insert(id, note);
                Trial {
                    id,
                    study_id: study,
                    number: t.number,
                    raw_state: t.state,
                }
            })
            .collect())
    }

    async fn get_annotation(&self, trial: &Trial) -> Result<Annotation> {
        let listed = self.listed_notes.lock().remove(&trial.id);
        if let Some(listed) = listed {
            return Ok(listed);
        }

        let detail = self.study_detail(trial.study_id).await?;
        let found = detail
            .trials
            .into_iter()
            .find(|t| t.trial_id == trial.id.0)
            .ok_or_else(|| StoreError::NotFound(format!("trial {}", trial.id)))?;
        Ok(found
            .note
            .map(|n| Annotation::new(n.body, n.version))
            .unwrap_or_default())
    }

    async fn write_annotation(
        &self,
        trial: &Trial,
        body: &str,
        expected_version: u64,
    ) -> Result<u64> {
        self.listed_notes.lock().remove(&trial.id);
        let new_version = expected_version + 1;
        let resp = self
            .client
            .put(self.url(&format!("/api/studies/{}/{}/note", trial.study_id, trial.id)))
            .json(&NoteBody {
                version: new_version,
                body: body.to_string(),
            })
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(StoreError::VersionConflict {
                trial: trial.id,
                expected: expected_version,
            });
        }
        check_status(resp, &format!("note of trial {}", trial.id))?;
        Ok(new_version)
    }

    async fn set_state(&self, trial: &Trial, state: TrialState) -> Result<()> {
        let resp = self
            .client
            .post(self.url(&format!("/api/trials/{}/tell", trial.id)))
            .json(&TellBody {
                state: state.as_str(),
            })
            .send()
            .await?;
        check_status(resp, &format!("state of trial {}", trial.id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Monitor;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use trialwatch_core::models::{MonitorConfig, RuleSet, StudySelector};

    fn study_detail_body() -> serde_json::Value {
        json!({
            "trials": [
                { "trial_id": 7, "number": 0, "state": "Running",
                  "note": { "version": 3, "body": "PRUNE" } },
                { "trial_id": 8, "number": 1, "state": "Complete",
                  "note": { "version": 0, "body": "" } },
                { "trial_id": 9, "number": 2, "state": "Waiting" }
            ]
        })
    }

    #[tokio::test]
    async fn test_list_studies() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/studies");
                then.status(200).json_body(json!({
                    "study_summaries": [{ "study_id": 1, "study_name": "resnet" }]
                }));
            })
            .await;

        let store = HttpStore::new(&server.base_url()).unwrap();
        let studies = store.list_studies().await.unwrap();
        mock.assert_async().await;
        assert_eq!(
            studies,
            vec![Study {
                id: StudyId(1),
                name: "resnet".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_list_trials_filters_terminal_states() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/studies/1")
                    .query_param("after", "0");
                then.status(200).json_body(study_detail_body());
            })
            .await;

        let store = HttpStore::new(&server.base_url()).unwrap();
        let active = store.list_trials(StudyId(1), TrialScope::ActiveOnly).await.unwrap();
        let ids: Vec<u64> = active.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![7, 9]);

        let all = store.list_trials(StudyId(1), TrialScope::AllTrials).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_get_annotation_defaults_missing_note() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/studies/1");
                then.status(200).json_body(study_detail_body());
            })
            .await;

        let store = HttpStore::new(&server.base_url()).unwrap();
        let running = Trial::new(TrialId(7), StudyId(1), 0, TrialState::Running);
        assert_eq!(
            store.get_annotation(&running).await.unwrap(),
            Annotation::new("PRUNE", 3)
        );

        let waiting = Trial::new(TrialId(9), StudyId(1), 2, TrialState::Waiting);
        assert_eq!(store.get_annotation(&waiting).await.unwrap(), Annotation::default());

        let missing = Trial::new(TrialId(99), StudyId(1), 5, TrialState::Running);
        assert!(matches!(
            store.get_annotation(&missing).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listed_note_is_served_once() {
        let server = MockServer::start_async().await;
        let detail = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/studies/1");
                then.status(200).json_body(study_detail_body());
            })
            .await;

        let store = HttpStore::new(&server.base_url()).unwrap();
        let trials = store.list_trials(StudyId(1), TrialScope::ActiveOnly).await.unwrap();
        assert_eq!(detail.hits_async().await, 1);

        let first = store.get_annotation(&trials[0]).await.unwrap();
        assert_eq!(first, Annotation::new("PRUNE", 3));
        assert_eq!(detail.hits_async().await, 1);

        // A second read must see writes made since the listing.
        store.get_annotation(&trials[0]).await.unwrap();
        assert_eq!(detail.hits_async().await, 2);
    }

    #[tokio::test]
    async fn test_cycle_fetches_study_once_plus_once_per_transition() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/studies");
                then.status(200).json_body(json!({
                    "study_summaries": [{ "study_id": 1, "study_name": "resnet" }]
                }));
            })
            .await;
        let detail = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/studies/1");
                then.status(200).json_body(json!({
                    "trials": [
                        { "trial_id": 7, "number": 0, "state": "Running",
                          "note": { "version": 3, "body": "PRUNE" } },
                        { "trial_id": 8, "number": 1, "state": "Running",
                          "note": { "version": 1, "body": "looks fine" } },
                        { "trial_id": 9, "number": 2, "state": "Waiting" },
                        { "trial_id": 10, "number": 3, "state": "Running",
                          "note": { "version": 2, "body": "lr too high?" } },
                        { "trial_id": 11, "number": 4, "state": "Complete",
                          "note": { "version": 0, "body": "" } }
                    ]
                }));
            })
            .await;
        let tell = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/trials/7/tell")
                    .json_body(json!({ "state": "Pruned" }));
                then.status(204);
            })
            .await;

        let config = MonitorConfig {
            rules: RuleSet::prune_then_fail("PRUNE", "FAIL").unwrap(),
            studies: StudySelector::All,
            ..Default::default()
        };
        let store = HttpStore::new(&server.base_url()).unwrap();
        let mut monitor = Monitor::new(Arc::new(store), config);

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.scanned, 4);
        assert_eq!(report.transitioned, vec![(TrialId(7), TrialState::Pruned)]);
        // One listing plus the version check before the single transition.
        assert_eq!(detail.hits_async().await, 2);
        assert_eq!(tell.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_write_annotation_sends_next_version() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/api/studies/1/7/note")
                    .json_body(json!({ "version": 4, "body": "PRUNE\nhandled" }));
                then.status(204);
            })
            .await;

        let store = HttpStore::new(&server.base_url()).unwrap();
        let trial = Trial::new(TrialId(7), StudyId(1), 0, TrialState::Running);
        let version = store
            .write_annotation(&trial, "PRUNE\nhandled", 3)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(version, 4);
    }

    #[tokio::test]
    async fn test_write_annotation_conflict() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/studies/1/7/note");
                then.status(409);
            })
            .await;

        let store = HttpStore::new(&server.base_url()).unwrap();
        let trial = Trial::new(TrialId(7), StudyId(1), 0, TrialState::Running);
        let result = store.write_annotation(&trial, "x", 3).await;
        assert!(matches!(
            result,
            Err(StoreError::VersionConflict { expected: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_set_state_posts_tell() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/trials/7/tell")
                    .json_body(json!({ "state": "Pruned" }));
                then.status(204);
            })
            .await;

        let store = HttpStore::new(&server.base_url()).unwrap();
        let trial = Trial::new(TrialId(7), StudyId(1), 0, TrialState::Running);
        store.set_state(&trial, TrialState::Pruned).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/studies");
                then.status(503);
            })
            .await;

        let store = HttpStore::new(&server.base_url()).unwrap();
        let err = store.list_studies().await.unwrap_err();
        assert!(err.is_transient());
    }
}
