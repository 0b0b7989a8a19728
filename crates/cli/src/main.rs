//! ChatMinds CLI - the main entry point.
//!
//! Commands:
//! - `init`       - Write a default config file
//! - `serve`      - Start the HTTP gateway
//! - `chat`       - Run one conversation or document turn
//! - `ingest`     - Register an already extracted text file as a document
//! - `history`    - Print a conversation or document thread
//! - `documents`  - List a session's documents

use clap::{Args, Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "chatminds",
    about = "ChatMinds — conversation and document chat over pluggable LLM backends",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Which thread a command targets.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct ThreadArgs {
    /// Conversation id
    #[arg(short, long)]
    pub conversation: Option<String>,

    /// Document id
    #[arg(short, long)]
    pub document: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one message and print the reply
    Chat {
        /// Session id that owns the thread
        #[arg(short, long, env = "CHATMINDS_SESSION")]
        session: String,

        #[command(flatten)]
        thread: ThreadArgs,

        /// Print the reply as it streams in
        #[arg(long)]
        stream: bool,

        /// Replace the configured system directive for this turn
        #[arg(long)]
        directive: Option<String>,

        /// The message text
        message: String,
    },

    /// Register a plain-text file as a document
    Ingest {
        #[arg(short, long, env = "CHATMINDS_SESSION")]
        session: String,

        /// Document title (defaults to the file name)
        #[arg(short, long)]
        title: Option<String>,

        /// Page count reported by the extractor
        #[arg(long)]
        pages: Option<u32>,

        /// Path to the extracted text
        file: std::path::PathBuf,
    },

    /// Print the messages of a thread
    History {
        #[arg(short, long, env = "CHATMINDS_SESSION")]
        session: String,

        #[command(flatten)]
        thread: ThreadArgs,
    },

    /// List documents of a session
    Documents {
        #[arg(short, long, env = "CHATMINDS_SESSION")]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { force } => commands::init::run(force).await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Chat {
            session,
            thread,
            stream,
            directive,
            message,
        } => commands::chat::run(&session, &thread, stream, directive, message).await?,
        Commands::Ingest {
            session,
            title,
            pages,
            file,
        } => commands::ingest::run(&session, title, pages, &file).await?,
        Commands::History { session, thread } => commands::history::run(&session, &thread).await?,
        Commands::Documents { session } => commands::documents::run(&session).await?,
    }

    Ok(())
}
