//! Contract interfaces for external collaborators.
//!
//! The core never ships production implementations of these — safety
//! filtering and document extraction are separate concerns plugged in at
//! process init. Both traits are sync and dyn-safe so adapters stay free
//! to do their work however they like behind the seam.

use crate::error::ResearchError;
use crate::evidence::Evidence;

/// Decision from a content safety screen at evidence ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Evidence passes unchanged.
    Allow,
    /// Evidence passes with the excerpt replaced (e.g. PII redacted).
    Redact(String),
    /// Evidence is dropped entirely.
    Deny,
}

/// Content safety filter invoked on each evidence item before storage.
pub trait Guard: Send + Sync {
    fn screen(&self, evidence: &Evidence) -> GuardVerdict;
}

/// Optional evidence source for binary document formats (PDF, DOCX, …).
pub trait DocumentExtractor: Send + Sync {
    /// Whether this extractor handles the given MIME type.
    fn supports(&self, content_type: &str) -> bool;

    /// Extract plain text from raw document bytes.
    fn extract(&self, data: &[u8]) -> Result<String, ResearchError>;
}
