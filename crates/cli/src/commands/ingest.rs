//! `chatminds ingest` - Register an extracted text file as a document.

use std::path::Path;

use chatminds_core::document::NewDocument;
use chatminds_core::store::{DocumentStore, OwnerStore};

use super::{CmdResult, load_config, open_store};

pub async fn run(session: &str, title: Option<String>, pages: Option<u32>, file: &Path) -> CmdResult {
    let text = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", file.display()))?;
    if text.trim().is_empty() {
        return Err(format!("{} contains no text", file.display()).into());
    }

    let config = load_config()?;
    let store = open_store(&config).await?;
    let owner = store.resolve_owner(session).await?;

    let record = store
        .insert_document(
            &owner,
            NewDocument {
                title,
                filename: file.file_name().map(|n| n.to_string_lossy().into_owned()),
                text,
                storage_path: None,
                page_count: pages,
            },
        )
        .await?;

    tracing::info!(document = %record.id, "Document ingested");
    println!("{}", record.id);
    println!("   Title:      {}", record.title);
    println!("   Characters: {}", record.char_count());

    store.close().await;
    Ok(())
}
