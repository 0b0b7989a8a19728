//! `chatminds chat` - Run a single turn from the command line.

use std::io::Write;
use std::sync::Arc;

use chatminds_core::store::OwnerStore;
use chatminds_engine::{Orchestrator, TurnEvent, TurnRequest};
use tracing::debug;

use super::{CmdResult, load_config, open_store, thread_key};
use crate::ThreadArgs;

pub async fn run(
    session: &str,
    thread: &ThreadArgs,
    stream: bool,
    directive: Option<String>,
    message: String,
) -> CmdResult {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let provider = chatminds_providers::build_from_config(&config)?;

    let owner = store.resolve_owner(session).await?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config, store.clone(), provider));

    let request = TurnRequest {
        owner,
        key: thread_key(thread),
        text: message,
        directive,
    };
    debug!(session, key = %request.key, stream, provider = orchestrator.provider_name(), "Running turn");

    if stream {
        let mut events = orchestrator.spawn_stream(request);
        let mut stdout = std::io::stdout();
        while let Some(event) = events.recv().await {
            match event {
                TurnEvent::Chunk { chunk } => {
                    print!("{chunk}");
                    stdout.flush()?;
                }
                TurnEvent::Done { .. } => println!(),
                TurnEvent::Error { error } => {
                    println!();
                    store.close().await;
                    return Err(error.into());
                }
            }
        }
    } else {
        let result = orchestrator.turn(request).await;
        match result {
            Ok(outcome) => println!("{}", outcome.text),
            Err(e) => {
                store.close().await;
                return Err(e.into());
            }
        }
    }

    store.close().await;
    Ok(())
}
