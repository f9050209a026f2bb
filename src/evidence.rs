//! Evidence identity and normalisation.
//!
//! Evidence is keyed two ways:
//! - `id` — a deterministic fingerprint of `(origin, url, sub_query_id, ordinal)`.
//!   Two items with equal ids are the same evidence.
//! - `content_hash` — sha256 of the normalised excerpt. Catches the same text
//!   arriving under different ids (e.g. two sub-queries hitting the same page).
//!
//! Collections are bags keyed by id; semantic retrieval is a separate read path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use std::collections::HashSet;

/// Excerpts are capped at ingest — search providers can return page-sized blobs.
pub const MAX_EXCERPT_CHARS: usize = 1000;

/// Where a piece of evidence came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSource {
    pub url: String,
    pub title: String,
    pub fetched_at: DateTime<Utc>,
}

/// A normalised unit of source material: source metadata plus an excerpt,
/// used both to answer the query and to cite the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub source: EvidenceSource,
    pub excerpt: String,
    /// sha256 of the normalised excerpt; dedupe key when ids differ.
    pub content_hash: Option<String>,
    /// Upstream relevance in [0,1]. Missing means "unscored".
    pub score: Option<f64>,
    /// Always contains the origin (`web|news|academic|document`) and the
    /// sub-query id that produced this item.
    pub tags: Vec<String>,
    pub cit_key: Option<String>,
    /// The sub-query id (or `refinement_*`) that caused ingest.
    pub produced_by: String,
}

impl Evidence {
    /// Effective relevance: unscored evidence reads as 0.5.
    pub fn relevance(&self) -> f64 {
        self.score.unwrap_or(0.5)
    }
}

/// Deterministic evidence id from the identity tuple.
pub fn fingerprint(origin: &str, url: &str, sub_query_id: &str, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(origin.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    hasher.update(b"|");
    hasher.update(sub_query_id.as_bytes());
    hasher.update(b"|");
    hasher.update(ordinal.to_le_bytes());
    let digest = hasher.finalize();
    format!("ev_{}", &hex::encode(digest)[..16])
}

/// Strong hash of the normalised excerpt text (lowercased, whitespace collapsed).
pub fn content_hash(excerpt: &str) -> String {
    let normalised: String = excerpt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = Sha256::digest(normalised.as_bytes());
    hex::encode(digest)
}

/// Collection name for a research run, stable for a given main query.
pub fn collection_for(main_query: &str) -> String {
    let digest = Sha256::digest(main_query.as_bytes());
    format!("research_{}", &hex::encode(digest)[..8])
}

/// Canonicalise a URL for evidence identity:
/// lowercase scheme and host, strip the fragment, remove default ports.
///
/// Best-effort string surgery — malformed input passes through trimmed
/// rather than erroring, since provider URLs are untrusted anyway.
pub fn canonicalize_url(url: &str) -> String {
    let mut s = url.trim().to_string();

    // Strip fragment first — never part of identity.
    if let Some(pos) = s.find('#') {
        s.truncate(pos);
    }

    // Split off the scheme, lowercase it.
    let (scheme, rest) = match s.find("://") {
        Some(pos) => (s[..pos].to_lowercase(), s[pos + 3..].to_string()),
        None => return s,
    };

    // Authority runs to the first '/', '?' or end.
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let mut authority = rest[..authority_end].to_lowercase();
    let tail = &rest[authority_end..];

    // Remove default ports for the scheme.
    let default_port = match scheme.as_str() {
        "http" => Some(":80"),
        "https" => Some(":443"),
        _ => None,
    };
    if let Some(port) = default_port
        && authority.ends_with(port)
    {
        authority.truncate(authority.len() - port.len());
    }

    format!("{scheme}://{authority}{tail}")
}

/// Cap a string at `max` characters on a char boundary.
pub fn cap_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Append `new` items to `all`, preserving order and skipping anything whose
/// id or content hash is already present. First insertion wins ties.
pub fn merge_dedupe(all: &mut Vec<Evidence>, new: Vec<Evidence>) {
    let mut ids: HashSet<String> = all.iter().map(|e| e.id.clone()).collect();
    let mut hashes: HashSet<String> = all
        .iter()
        .filter_map(|e| e.content_hash.clone())
        .collect();

    for ev in new {
        if ids.contains(&ev.id) {
            continue;
        }
        if let Some(h) = &ev.content_hash
            && hashes.contains(h)
        {
            continue;
        }
        ids.insert(ev.id.clone());
        if let Some(h) = &ev.content_hash {
            hashes.insert(h.clone());
        }
        all.push(ev);
    }
}
