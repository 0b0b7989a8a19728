//! Ingested document records.
//!
//! Text extraction happens upstream; by the time a document reaches the
//! store its `text` is opaque and is never re-parsed or mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{DocumentId, OwnerId};

/// Title used when neither the extractor nor the upload supplies one.
pub const UNTITLED: &str = "Untitled document";

/// A stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub owner: OwnerId,
    pub id: DocumentId,
    pub title: String,
    /// Full extracted text.
    pub text: String,
    /// Where the uploaded file lives, if it was kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Ingestion hand-off from the upload/extraction collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDocument {
    pub title: Option<String>,
    /// Original upload file name, used as a title fallback.
    pub filename: Option<String>,
    pub text: String,
    pub storage_path: Option<String>,
    pub page_count: Option<u32>,
}

impl NewDocument {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            text: text.into(),
            ..Default::default()
        }
    }

    /// The display title: explicit title, then file name, then [`UNTITLED`].
    pub fn resolved_title(&self) -> String {
        [self.title.as_deref(), self.filename.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|t| !t.is_empty())
            .unwrap_or(UNTITLED)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_falls_back_to_filename_then_placeholder() {
        let mut doc = NewDocument { text: "x".into(), ..Default::default() };
        assert_eq!(doc.resolved_title(), UNTITLED);

        doc.filename = Some("report.pdf".into());
        assert_eq!(doc.resolved_title(), "report.pdf");

        doc.title = Some("  ".into());
        assert_eq!(doc.resolved_title(), "report.pdf");

        doc.title = Some("Quarterly Report".into());
        assert_eq!(doc.resolved_title(), "Quarterly Report");
    }
}
