//! Opaque ids and human-friendly name generation.
//!
//! Per the registry guidance in the design notes: every cross-component
//! reference is an id looked up through its owning registry, never a shared
//! pointer into another component's state.

use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

const PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b'/').add(b'?').add(b'#').add(b' ');

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId(pub String);

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RepoId {
    /// Derives a stable id from an `org/repo`-shaped remote, e.g.
    /// `git@github.com:acme/demo.git` -> `acme/demo`.
    pub fn from_remote(remote_url: &str) -> RepoId {
        let trimmed = remote_url
            .trim_end_matches('/')
            .trim_end_matches(".git");

        let tail = trimmed
            .rsplit_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        let tail = tail
            .rsplit_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(tail);

        let mut segments: Vec<&str> = tail.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() > 2 {
            let len = segments.len();
            segments = segments[len - 2..].to_vec();
        }

        RepoId(segments.join("/"))
    }

    pub fn percent_encoded(&self) -> String {
        utf8_percent_encode(&self.0, PATH_SEGMENT).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorktreeId(pub String);

impl fmt::Display for WorktreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WorktreeId {
    /// Derived deterministically from `name` with URL-safe escaping.
    pub fn from_name(name: &str) -> WorktreeId {
        WorktreeId(
            name.to_lowercase()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                .collect(),
        )
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow", "indigo", "jolly",
    "keen", "lively", "mellow", "nimble", "opal", "plucky", "quiet", "rustic", "sly", "tidy",
    "umber", "vivid", "witty", "zesty", "bold", "crisp", "dapper", "earnest",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "cedar", "meadow", "ember", "harbor", "lantern", "willow", "thicket",
    "ridge", "comet", "marsh", "quartz", "sparrow", "tundra", "yarrow", "zephyr", "badger",
    "canyon", "delta", "forge", "grove", "heron", "inlet", "jasper", "kestrel",
];

/// Generates a `<adjective>-<noun>` name. `attempt` selects a distinct
/// combination for retrying past a collision; beyond the adjective*noun
/// space it falls back to an integer suffix, satisfying the bounded-retry
/// requirement.
pub fn two_word_name(seed: u64, attempt: u32) -> String {
    let space = (ADJECTIVES.len() * NOUNS.len()) as u64;
    let combo = seed.wrapping_add(attempt as u64) % space;
    let adjective = ADJECTIVES[(combo / NOUNS.len() as u64) as usize];
    let noun = NOUNS[(combo % NOUNS.len() as u64) as usize];

    if (attempt as usize) < ADJECTIVES.len() * NOUNS.len() {
        format!("{adjective}-{noun}")
    } else {
        format!("{adjective}-{noun}-{attempt}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_from_ssh_remote() {
        assert_eq!(
            RepoId::from_remote("git@github.com:acme/demo.git").0,
            "acme/demo"
        );
    }

    #[test]
    fn repo_id_from_https_remote() {
        assert_eq!(
            RepoId::from_remote("https://github.com/acme/demo.git").0,
            "acme/demo"
        );
    }

    #[test]
    fn two_word_name_is_deterministic_per_seed_and_attempt() {
        assert_eq!(two_word_name(42, 0), two_word_name(42, 0));
        assert_ne!(two_word_name(42, 0), two_word_name(42, 1));
    }

    #[test]
    fn two_word_name_falls_back_to_suffix_past_combo_space() {
        let total = (ADJECTIVES.len() * NOUNS.len()) as u32;
        let name = two_word_name(0, total);
        assert!(name.chars().last().unwrap().is_ascii_digit());
    }

    #[test]
    fn worktree_id_from_name_is_url_safe() {
        let id = WorktreeId::from_name("Fuzzy Otter!");
        assert_eq!(id.0, "fuzzy-otter-");
    }
}
