//! Result markers
//!
//! A remote script hands values back by printing lines of the form
//! `!!NEB_SCRIPT_RESULT_<KEY>:<VALUE>!!`. KEY may not contain `:` and VALUE
//! may not contain `!`; there is no escaping. Only the first marker of a
//! line counts and a later occurrence of a key replaces an earlier one.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::log_store::LogStore;

/// Key under which the join-token script reports its token
pub const JOIN_TOKEN_KEY: &str = "KUBERNETES_JOIN_TOKEN";

static RESULT_MARKER_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"!!NEB_SCRIPT_RESULT_([^:]+):([^!]+)!!").ok());

/// Renders a marker line a script would print for `key`/`value`
pub fn marker_line(key: &str, value: &str) -> String {
    format!("!!NEB_SCRIPT_RESULT_{}:{}!!", key, value)
}

/// Extracts all results from captured output
pub fn extract_results(output: &str) -> HashMap<String, String> {
    let mut results = HashMap::new();
    let Some(pattern) = RESULT_MARKER_PATTERN.as_ref() else {
        return results;
    };

    for line in output.lines() {
        if let Some(caps) = pattern.captures(line) {
            results.insert(caps[1].to_string(), caps[2].to_string());
        }
    }

    results
}

/// Reads an execution log and extracts its results.
///
/// An absent or unreadable log yields an empty map.
pub async fn read_results(store: &dyn LogStore, log_id: &str) -> HashMap<String, String> {
    match store.read(log_id).await {
        Ok(Some(bytes)) => extract_results(&String::from_utf8_lossy(&bytes)),
        Ok(None) => HashMap::new(),
        Err(e) => {
            tracing::warn!("Failed to read execution log {} for results: {}", log_id, e);
            HashMap::new()
        }
    }
}
