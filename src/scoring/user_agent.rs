use std::sync::Arc;

use aho_corasick::AhoCorasick;

use super::{Scorer, SubScore, MAX_THREAT_LEVEL};
use crate::request::IncomingRequest;
use crate::util::ac_for;

/// Fingerprints of common scanning and exploitation tools.
pub const SCANNER_SIGNATURES: &[&str] = &[
    "sqlmap",
    "sqlninja",
    "havij",
    "nikto",
    "w3af",
    "acunetix",
    "netsparker",
    "nmap",
    "nessus",
    "masscan",
    "zgrab",
    "zmap",
    "nuclei",
    "gobuster",
    "dirbuster",
    "wpscan",
    "feroxbuster",
    "ffuf",
    "openvas",
    "whatweb",
];

/// Scores the `User-Agent` header.  A known scanner ends classification at
/// the maximum; a missing agent is suspicious on its own.
pub struct UserAgentScorer {
    matcher: Option<Arc<AhoCorasick>>,
}

impl UserAgentScorer {
    pub fn new(extra: &[String]) -> Self {
        let mut list: Vec<String> = SCANNER_SIGNATURES.iter().map(|s| s.to_string()).collect();
        list.extend(
            extra
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        );
        let matcher = match ac_for(&list) {
            Ok(ac) => Some(ac),
            Err(err) => {
                tracing::warn!(error = %err, "failed to build scanner signature matcher; signature checks disabled");
                None
            }
        };
        Self { matcher }
    }

    pub fn is_scanner(&self, agent: &str) -> bool {
        self.matcher.as_ref().is_some_and(|ac| ac.is_match(agent))
    }
}

impl Scorer for UserAgentScorer {
    fn name(&self) -> &'static str {
        "user_agent"
    }

    fn score(&self, req: &IncomingRequest) -> SubScore {
        match req.user_agent().map(str::trim).filter(|ua| !ua.is_empty()) {
            Some(agent) if self.is_scanner(agent) => SubScore::Final(MAX_THREAT_LEVEL),
            Some(_) => SubScore::Partial(5),
            None => SubScore::Partial(10),
        }
    }
}
