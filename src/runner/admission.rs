//! Job admission: a per-instance veto evaluated before a job runs.
//!
//! The guard string stored with an instance selects the policy:
//!
//! | guard                       | policy                         |
//! |-----------------------------|--------------------------------|
//! | empty                       | [`AllowAll`]                   |
//! | `repo:owner/name,owner/*`   | [`RepositoryAllowList`]        |
//! | anything else               | [`Unsupported`], denies all    |

use std::sync::Arc;

use serde_json::Value;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(String),
}

/// Evaluated against the job's `github` context.
pub trait JobAdmissionPolicy: Send + Sync {
    fn evaluate(&self, github: &Value) -> Admission;
}

pub struct AllowAll;

impl JobAdmissionPolicy for AllowAll {
    fn evaluate(&self, _github: &Value) -> Admission {
        Admission::Allow
    }
}

/// Accepts jobs whose `github.repository` matches one of the patterns.
/// A pattern is either `owner/name` or `owner/*`; matching ignores case.
#[derive(Debug, Clone)]
pub struct RepositoryAllowList {
    patterns: Vec<String>,
}

impl RepositoryAllowList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    fn matches(pattern: &str, repository: &str) -> bool {
        match pattern.strip_suffix("/*") {
            Some(owner) => repository
                .split_once('/')
                .is_some_and(|(o, name)| o == owner && !name.is_empty()),
            None => pattern == repository,
        }
    }
}

impl JobAdmissionPolicy for RepositoryAllowList {
    fn evaluate(&self, github: &Value) -> Admission {
        let Some(repository) = github.get("repository").and_then(Value::as_str) else {
            return Admission::Deny("the job has no github.repository".to_string());
        };
        let repository = repository.to_ascii_lowercase();
        if self.patterns.iter().any(|p| Self::matches(p, &repository)) {
            Admission::Allow
        } else {
            Admission::Deny(format!("repository {} is not allowed on this runner", repository))
        }
    }
}

/// Stands in for a guard this build cannot evaluate.
pub struct Unsupported {
    guard: String,
}

impl JobAdmissionPolicy for Unsupported {
    fn evaluate(&self, _github: &Value) -> Admission {
        Admission::Deny(format!("Failed to run `{}`: unsupported runner guard", self.guard))
    }
}

/// Policy for an instance's guard string.
pub fn policy_for_guard(guard: &str) -> Arc<dyn JobAdmissionPolicy> {
    let guard = guard.trim();
    if guard.is_empty() {
        return Arc::new(AllowAll);
    }
    match guard.strip_prefix("repo:") {
        Some(list) => Arc::new(RepositoryAllowList::new(list.split(','))),
        None => {
            tracing::warn!("Runner guard `{}` is not supported, every job will be rejected", guard);
            Arc::new(Unsupported {
                guard: guard.to_string(),
            })
        }
    }
}
