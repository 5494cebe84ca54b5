//! Secret redaction for job log lines.

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;

use crate::protocol::job::AgentJobRequestMessage;

/// Replacement for every redacted value.
pub const MASK: &str = "***";

/// Replaces known secret values and server-provided regex hints.
pub struct SecretMasker {
    /// Literal secret values, longest match wins.
    literals: Option<AhoCorasick>,
    literal_count: usize,
    patterns: Vec<Regex>,
}

impl SecretMasker {
    pub fn new<S, P>(secrets: S, patterns: P) -> Self
    where
        S: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        let mut secrets: Vec<String> = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        secrets.sort();
        secrets.dedup();

        let literals = if secrets.is_empty() {
            None
        } else {
            match AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostLongest)
                .build(&secrets)
            {
                Ok(matcher) => Some(matcher),
                Err(e) => {
                    tracing::warn!("Cannot build secret matcher: {}", e);
                    None
                }
            }
        };

        let patterns = patterns
            .into_iter()
            .filter(|p| !p.is_empty())
            .filter_map(|p| match Regex::new(&p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Ignoring invalid mask hint `{}`: {}", p, e);
                    None
                }
            })
            .collect();

        Self {
            literal_count: secrets.len(),
            literals,
            patterns,
        }
    }

    /// Secret variables and `regex` mask hints of a job.
    pub fn from_job(job: &AgentJobRequestMessage) -> Self {
        let secrets = job
            .variables
            .values()
            .filter(|v| v.is_secret)
            .map(|v| v.value.clone());
        let patterns = job
            .mask
            .iter()
            .filter(|hint| hint.kind.eq_ignore_ascii_case("regex"))
            .map(|hint| hint.value.clone());
        Self::new(secrets, patterns)
    }

    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.patterns {
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, MASK).into_owned();
            }
        }
        if let Some(literals) = &self.literals {
            let replacements = vec![MASK; self.literal_count];
            out = literals.replace_all(&out, &replacements);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_none() && self.patterns.is_empty()
    }
}
