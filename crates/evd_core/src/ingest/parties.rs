//! Heuristic party and category tagging.
//!
//! Matching is done on token boundaries over lowercased text, so the alias
//! `acme` tags "ACME Insurance" but not "acmeology".

use std::collections::BTreeSet;
use std::path::Path;

use crate::config::CaseConfig;
use crate::domain::DocumentFormat;
use crate::fulltext::tokenize;

fn token_line(text: &str) -> String {
    format!(" {} ", tokenize(text).join(" "))
}

fn mentions(haystack: &str, needle: &str) -> bool {
    let needle = token_line(needle);
    !needle.trim().is_empty() && haystack.contains(&needle)
}

/// Configured parties mentioned in the file name, text, or message participants.
/// Participants that match no configured party are kept as their own tag.
pub fn infer_parties(
    cfg: &CaseConfig,
    path: &Path,
    text: &str,
    participants: &[String],
) -> Vec<String> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let haystack = format!("{}{}", token_line(&file_name), token_line(text));

    let mut out = BTreeSet::new();
    for (party, aliases) in &cfg.parties {
        let names = std::iter::once(party.as_str()).chain(aliases.iter().map(String::as_str));
        if names.clone().any(|n| mentions(&haystack, n)) {
            out.insert(party.clone());
        }
    }

    for participant in participants {
        let line = token_line(participant);
        let matched = cfg.parties.iter().find(|(party, aliases)| {
            std::iter::once(party.as_str())
                .chain(aliases.iter().map(String::as_str))
                .any(|n| mentions(&line, n))
        });
        match matched {
            Some((party, _)) => out.insert(party.clone()),
            None => out.insert(participant.to_lowercase()),
        };
    }
    out.into_iter().collect()
}

/// The detected format plus every configured category with a keyword in the text.
pub fn infer_categories(cfg: &CaseConfig, format: DocumentFormat, text: &str) -> Vec<String> {
    let haystack = token_line(text);
    let mut out = BTreeSet::new();
    out.insert(format.as_str().to_string());
    for (category, keywords) in &cfg.categories {
        if keywords.iter().any(|k| mentions(&haystack, k)) {
            out.insert(category.clone());
        }
    }
    out.into_iter().collect()
}
