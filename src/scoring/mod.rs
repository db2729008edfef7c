//! Threat classification for Tarpit.
//!
//! Each scorer looks at one dimension of a request and produces either a
//! partial score, which is averaged with the others, or a final score that
//! ends classification immediately.  The [`ThreatClassifier`] runs the
//! scorers in their declared order and stops at the first final score.

use std::sync::Arc;

use serde::Serialize;

use crate::request::IncomingRequest;
use crate::util::mean_round_half_up;

pub mod method;
pub mod payload;
pub mod uri;
pub mod user_agent;

use self::method::MethodScorer;
use self::payload::{BodyScorer, QueryScorer};
use self::uri::UriScorer;
use self::user_agent::UserAgentScorer;

/// Highest score a request can receive.
pub const MAX_THREAT_LEVEL: u8 = 10;

/// Classifier tuning loaded from the environment.
#[derive(Clone, Debug, Default)]
pub struct ClassifierConfig {
    /// Scanner signatures appended to the built-in list.
    pub extra_scanner_signatures: Vec<String>,
    /// Sensitive file or directory names appended to the built-in dictionary.
    pub extra_sensitive_files: Vec<String>,
}

/// Outcome of a single scorer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubScore {
    /// Contributes to the mean.
    Partial(u8),
    /// Ends classification with this score.
    Final(u8),
}

/// Trait implemented by every scoring dimension.
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, req: &IncomingRequest) -> SubScore;
}

/// Result of classifying one request, with the per-dimension trace kept for
/// the capture log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub threat_level: u8,
    /// Scorer that ended classification early, if any.
    pub short_circuit: Option<&'static str>,
    pub sub_scores: Vec<(&'static str, u8)>,
}

/// Runs the registered scorers in order.
#[derive(Clone)]
pub struct ThreatClassifier {
    scorers: Vec<Arc<dyn Scorer>>,
}

impl ThreatClassifier {
    /// Build the standard pipeline: user agent, method, uri, query, body.
    /// The user agent check must come first so scanner traffic scores the
    /// maximum even on allow-listed paths.
    pub fn new(cfg: &ClassifierConfig) -> Self {
        let scorers: Vec<Arc<dyn Scorer>> = vec![
            Arc::new(UserAgentScorer::new(&cfg.extra_scanner_signatures)),
            Arc::new(MethodScorer),
            Arc::new(UriScorer::new(&cfg.extra_sensitive_files)),
            Arc::new(QueryScorer),
            Arc::new(BodyScorer),
        ];
        Self { scorers }
    }

    /// Build a classifier from an explicit scorer list.
    pub fn with_scorers(scorers: Vec<Arc<dyn Scorer>>) -> Self {
        Self { scorers }
    }

    pub fn classify(&self, req: &IncomingRequest) -> u8 {
        self.classify_with_trace(req).threat_level
    }

    pub fn classify_with_trace(&self, req: &IncomingRequest) -> Classification {
        let mut sub_scores = Vec::with_capacity(self.scorers.len());
        for scorer in &self.scorers {
            let name = scorer.name();
            match scorer.score(req) {
                SubScore::Final(level) => {
                    tracing::trace!(scorer = name, level, "classification short-circuited");
                    sub_scores.push((name, level));
                    return Classification {
                        threat_level: level.min(MAX_THREAT_LEVEL),
                        short_circuit: Some(name),
                        sub_scores,
                    };
                }
                SubScore::Partial(level) => sub_scores.push((name, level)),
            }
        }
        let sum: u32 = sub_scores.iter().map(|(_, s)| u32::from(*s)).sum();
        let mean = mean_round_half_up(sum, sub_scores.len() as u32);
        Classification {
            threat_level: mean.min(u32::from(MAX_THREAT_LEVEL)) as u8,
            short_circuit: None,
            sub_scores,
        }
    }

    /// Number of registered scorers.
    pub fn len(&self) -> usize {
        self.scorers.len()
    }

    /// Returns true if the classifier has no registered scorers.
    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }
}

impl Default for ThreatClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}
