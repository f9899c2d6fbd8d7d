use std::borrow::Cow;
use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use snafu::{ResultExt, ensure};

use crate::error::{ChatResult, CompileDenyListSnafu, InvalidModerationConfigSnafu};

/// Replacement for every deny-listed match, whatever the matched word's length.
pub const MASK_TOKEN: &str = "****";

pub const DEFAULT_DENY_LIST: &[&str] = &["badword1", "badword2"];

/// Case-insensitive profanity mask applied before a message is persisted.
///
/// Construction rejects any deny-list entry sharing a character with the mask, which
/// keeps `apply` idempotent: masked output can never re-match.
#[derive(Debug, Clone)]
pub struct ModerationFilter {
    deny_list: Vec<String>,
    pattern: Option<Regex>,
}

impl ModerationFilter {
    pub fn new<I, S>(deny_list: I) -> ChatResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let deny_list = normalize_deny_list(deny_list);

        for entry in &deny_list {
            ensure!(
                !shares_mask_character(entry),
                InvalidModerationConfigSnafu {
                    stage: "moderation-validate-entry",
                    details: format!("deny-list entry '{entry}' collides with mask '{MASK_TOKEN}'"),
                }
            );
        }

        if deny_list.is_empty() {
            return Ok(Self {
                deny_list,
                pattern: None,
            });
        }

        let alternation = deny_list
            .iter()
            .map(|entry| regex::escape(entry))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .build()
            .context(CompileDenyListSnafu {
                stage: "moderation-compile",
            })?;

        Ok(Self {
            deny_list,
            pattern: Some(pattern),
        })
    }

    pub fn with_defaults() -> ChatResult<Self> {
        Self::new(DEFAULT_DENY_LIST.iter().copied())
    }

    pub fn apply(&self, text: &str) -> String {
        match &self.pattern {
            Some(pattern) => match pattern.replace_all(text, MASK_TOKEN) {
                Cow::Borrowed(unchanged) => unchanged.to_string(),
                Cow::Owned(masked) => masked,
            },
            None => text.to_string(),
        }
    }

    pub fn is_clean(&self, text: &str) -> bool {
        self.pattern
            .as_ref()
            .is_none_or(|pattern| !pattern.is_match(text))
    }

    pub fn deny_list(&self) -> &[String] {
        &self.deny_list
    }
}

/// Trims, drops blanks, de-duplicates case-insensitively, and orders longest first so
/// the alternation prefers the longest entry starting at a position.
fn normalize_deny_list<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut normalized = entries
        .into_iter()
        .map(|entry| entry.as_ref().trim().to_string())
        .filter(|entry| !entry.is_empty())
        .filter(|entry| seen.insert(entry.to_lowercase()))
        .collect::<Vec<_>>();

    normalized.sort_by(|left, right| {
        right
            .chars()
            .count()
            .cmp(&left.chars().count())
            .then_with(|| left.cmp(right))
    });
    normalized
}

fn shares_mask_character(entry: &str) -> bool {
    entry.chars().any(|entry_char| {
        MASK_TOKEN.chars().any(|mask_char| {
            entry_char == mask_char
                || entry_char.to_lowercase().eq(mask_char.to_lowercase())
                || entry_char.to_uppercase().eq(mask_char.to_uppercase())
        })
    })
}
