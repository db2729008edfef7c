use ahash::AHashSet;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Scorer, SubScore, MAX_THREAT_LEVEL};
use crate::request::{IncomingRequest, ALLOW_LISTED_PATHS};
use crate::util::path_segments;

/// File and directory names that only show up when someone is hunting for
/// configuration, credentials or an admin surface.  Lower case.
pub const SENSITIVE_FILES: &[&str] = &[
    // WordPress
    "wp-login.php",
    "xmlrpc.php",
    "wp-admin",
    "wp-content",
    "wp-includes",
    "wp-config.php",
    "wp-config.php.bak",
    "wp-config.bak",
    // environment and VCS
    ".env",
    ".env.local",
    ".env.production",
    ".env.dev",
    ".env.bak",
    ".env.example",
    ".git",
    ".svn",
    ".hg",
    ".ds_store",
    ".config",
    // server configuration
    ".htaccess",
    ".htpasswd",
    "web.config",
    "server-status",
    "phpinfo.php",
    "phpmyadmin",
    "docker-compose.yml",
    "docker-compose.yaml",
    "dockerfile",
    // credentials and keys
    ".aws",
    ".ssh",
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
    "authorized_keys",
    ".git-credentials",
    ".npmrc",
    ".pypirc",
    ".dockercfg",
    ".netrc",
    ".pgpass",
    "credentials",
    "secrets",
    "config",
    "settings",
    "database",
    // dumps and shells
    "backup.sql",
    "dump.sql",
    "db.sql",
    "shell.php",
    "eval-stdin.php",
];

/// Name families such as `config.yml`, `secrets.json` or `db.php`.
static SENSITIVE_FAMILY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(config|settings|database|db|secrets?|credentials?|creds|tokens?|access[_-]?tokens?|api[_-]?keys?|passwords?|passwd)\.[a-z0-9]{1,8}$",
    )
    .expect("static pattern compiles")
});

/// Scores the request path.  Allow-listed paths end classification at 1 and
/// sensitive names end it at the maximum.
pub struct UriScorer {
    dictionary: AHashSet<String>,
}

impl UriScorer {
    pub fn new(extra: &[String]) -> Self {
        let mut dictionary: AHashSet<String> =
            SENSITIVE_FILES.iter().map(|s| s.to_string()).collect();
        dictionary.extend(
            extra
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty()),
        );
        Self { dictionary }
    }

    /// True when any segment of `path` names a sensitive file or directory.
    pub fn is_sensitive(&self, path: &str) -> bool {
        path_segments(path).any(|segment| {
            let lower = segment.to_lowercase();
            self.dictionary.contains(&lower) || SENSITIVE_FAMILY_RE.is_match(&lower)
        })
    }
}

impl Scorer for UriScorer {
    fn name(&self) -> &'static str {
        "uri"
    }

    fn score(&self, req: &IncomingRequest) -> SubScore {
        if ALLOW_LISTED_PATHS.contains(&req.path.as_str()) {
            SubScore::Final(1)
        } else if self.is_sensitive(&req.path) {
            SubScore::Final(MAX_THREAT_LEVEL)
        } else {
            SubScore::Partial(7)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_dictionary_and_families() {
        let scorer = UriScorer::new(&[]);
        assert!(scorer.is_sensitive("/wp-config.php"));
        assert!(scorer.is_sensitive("/site/.ENV"));
        assert!(scorer.is_sensitive("/wp-admin/install.php"));
        assert!(scorer.is_sensitive("/app/config.toml"));
        assert!(scorer.is_sensitive("/secrets.json"));
        assert!(scorer.is_sensitive("/.git/HEAD"));
        assert!(!scorer.is_sensitive("/api/widgets"));
        assert!(!scorer.is_sensitive("/configure"));
        assert!(!scorer.is_sensitive("/"));
    }

    #[test]
    fn extra_names_extend_dictionary() {
        let scorer = UriScorer::new(&["Terraform.tfstate".to_string()]);
        assert!(scorer.is_sensitive("/infra/terraform.tfstate"));
    }
}
