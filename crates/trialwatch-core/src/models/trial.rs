use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a study inside the trial store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StudyId(pub u64);

/// Identifier of a trial inside the trial store. Unique across studies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialId(pub u64);

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Study {
    pub id: StudyId,
    pub name: String,
}

/// Lifecycle state of a trial, spelled the way the dashboard serializes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialState {
    Running,
    Waiting,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Pruned | Self::Fail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Waiting => "Waiting",
            Self::Complete => "Complete",
            Self::Pruned => "Pruned",
            Self::Fail => "Fail",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for TrialState {
    type Err = String;

    /// Accepts the dashboard spelling as well as upper-case and the
    /// `TrialState.X` form.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("TrialState.").unwrap_or(s);
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "WAITING" => Ok(Self::Waiting),
            "COMPLETE" => Ok(Self::Complete),
            "PRUNED" => Ok(Self::Pruned),
            "FAIL" | "FAILED" => Ok(Self::Fail),
            _ => Err(format!("unknown trial state '{}'", s)),
        }
    }
}

/// Which trials a poll cycle considers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialScope {
    /// Only RUNNING and WAITING trials.
    #[default]
    ActiveOnly,
    /// Every trial, allowing retroactive transitions out of terminal states.
    AllTrials,
}

impl TrialScope {
    /// Whether a trial whose state string is `raw_state` belongs to this scope.
    /// Unparseable states are kept so the caller can report them.
    pub fn includes(self, raw_state: &str) -> bool {
        match self {
            Self::AllTrials => true,
            Self::ActiveOnly => match raw_state.parse::<TrialState>() {
                Ok(state) => !state.is_terminal(),
                Err(_) => true,
            },
        }
    }
}

/// A trial as listed by the store. The state is kept in its raw wire form
/// so a malformed value only affects this trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub study_id: StudyId,
    pub number: u64,
    pub raw_state: String,
}

impl Trial {
    pub fn new(id: TrialId, study_id: StudyId, number: u64, state: TrialState) -> Self {
        Self {
            id,
            study_id,
            number,
            raw_state: state.as_str().to_string(),
        }
    }

    pub fn state(&self) -> std::result::Result<TrialState, String> {
        self.raw_state.parse()
    }
}

/// Versioned free-text note attached to a trial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub body: String,
    pub version: u64,
}

impl Annotation {
    pub fn new(body: impl Into<String>, version: u64) -> Self {
        Self {
            body: body.into(),
            version,
        }
    }

    /// Body truncated for log lines.
    pub fn preview(&self) -> String {
        const MAX: usize = 100;
        match self.body.char_indices().nth(MAX) {
            Some((idx, _)) => format!("{}...", &self.body[..idx]),
            None => self.body.clone(),
        }
    }
}

/// Studies the monitor watches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StudySelector {
    /// Nothing selected: the monitor idles.
    #[default]
    None,
    All,
    Named(Vec<String>),
}

impl StudySelector {
    /// Build a selector from raw CLI/config names. A single `all` (any case)
    /// selects every study; empty names are dropped.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();

        if names.len() == 1 && names[0].eq_ignore_ascii_case("all") {
            Self::All
        } else if names.is_empty() {
            Self::None
        } else {
            Self::Named(names)
        }
    }

    pub fn matches(&self, study: &Study) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Named(names) => names.iter().any(|n| n == &study.name),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::None)
    }
}
