//! Utility helpers for Tarpit.
//!
//! Small pieces shared by the classifier, the strategist and the store:
//! literal matcher caching, path segment helpers and integer rounding.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, BuildError};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::request::Headers;

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated lists.  The cache key is a hash of the pattern list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Given a list of literal patterns, return a shared ASCII case-insensitive
/// `AhoCorasick` matcher.  If a matcher for the list already exists in the
/// cache, a cloned Arc is returned.
pub fn ac_for(list: &[String]) -> Result<Arc<AhoCorasick>, BuildError> {
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return Ok(existing.clone());
    }
    let lower: Vec<String> = list.iter().map(|p| p.to_lowercase()).collect();
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(lower)?;
    let arc = Arc::new(ac);
    AC_CACHE.insert(key, arc.clone());
    Ok(arc)
}

/// The text after the last `/` of a path.  `"/a/b/wp-config.php"` yields
/// `"wp-config.php"`; a path ending in `/` yields an empty string.
pub fn final_segment(path: &str) -> &str {
    match memchr::memrchr(b'/', path.as_bytes()) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Non-empty `/`-separated segments of a path.
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Integer mean rounded half-up.  Returns 0 for an empty sample.
pub fn mean_round_half_up(sum: u32, count: u32) -> u32 {
    if count == 0 {
        return 0;
    }
    (2 * sum + count) / (2 * count)
}

/// Case-insensitive header lookup over the normalised header map.
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
