pub mod chat;
pub mod documents;
pub mod history;
pub mod ingest;
pub mod init;
pub mod serve;

use std::sync::Arc;

use chatminds_config::AppConfig;
use chatminds_core::message::ThreadKey;
use chatminds_store::SqliteStore;

use crate::ThreadArgs;

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

pub async fn open_store(config: &AppConfig) -> Result<Arc<SqliteStore>, Box<dyn std::error::Error>> {
    let store = SqliteStore::new(&config.store.path)
        .await
        .map_err(|e| format!("Failed to open store at {}: {e}", config.store.path))?;
    Ok(Arc::new(store))
}

/// clap guarantees exactly one of the two is set.
pub fn thread_key(args: &ThreadArgs) -> ThreadKey {
    match (&args.conversation, &args.document) {
        (_, Some(document)) => ThreadKey::document(document),
        (Some(conversation), None) => ThreadKey::conversation(conversation),
        (None, None) => ThreadKey::conversation(""),
    }
}
