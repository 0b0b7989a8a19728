//! `chatminds documents` - List a session's documents.

use chatminds_core::store::{DocumentStore, OwnerStore};

use super::{CmdResult, load_config, open_store};

pub async fn run(session: &str) -> CmdResult {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let owner = store.resolve_owner(session).await?;

    let documents = store.list_documents(&owner).await?;
    if documents.is_empty() {
        println!("No documents.");
    }
    for d in &documents {
        let pages = d.page_count.map(|p| format!("{p} pages")).unwrap_or_default();
        println!(
            "{}  {}  {} chars  {}  {}",
            d.id,
            d.created_at.format("%Y-%m-%d"),
            d.char_count(),
            pages,
            d.title
        );
    }

    store.close().await;
    Ok(())
}
