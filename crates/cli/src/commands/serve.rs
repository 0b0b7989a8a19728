//! `chatminds serve` - Start the HTTP API server.

use super::{CmdResult, load_config};

pub async fn run(port_override: Option<u16>) -> CmdResult {
    let mut config = load_config()?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    if !config.has_api_key() && config.provider != "ollama" {
        return Err(format!(
            "No API key configured for provider '{}'. Set CHATMINDS_API_KEY or api_key in {}",
            config.provider,
            chatminds_config::AppConfig::config_dir().join("config.toml").display()
        )
        .into());
    }

    println!("ChatMinds Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Provider:  {} ({})", config.provider, config.model);
    println!("   Store:     {}", config.store.path);

    chatminds_gateway::start(config).await?;

    Ok(())
}
