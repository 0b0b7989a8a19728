//! `chatminds history` - Print a thread.

use chatminds_core::store::{MessageStore, OwnerStore};

use super::{CmdResult, load_config, open_store, thread_key};
use crate::ThreadArgs;

pub async fn run(session: &str, thread: &ThreadArgs) -> CmdResult {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let owner = store.resolve_owner(session).await?;
    let key = thread_key(thread);
    key.validate()?;

    let messages = store.read(&owner, &key).await?;
    if messages.is_empty() {
        println!("No messages in {key}.");
    }
    for m in &messages {
        println!(
            "[{:>3}] {} {:<9} {}",
            m.sequence,
            m.created_at.format("%Y-%m-%d %H:%M:%S"),
            m.role,
            m.content
        );
    }

    store.close().await;
    Ok(())
}
