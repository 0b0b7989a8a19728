//! `chatminds init` - Write a default config file.

use chatminds_config::AppConfig;

use super::CmdResult;

pub async fn run(force: bool) -> CmdResult {
    let config_dir = AppConfig::config_dir();
    let config_path = std::env::var("CHATMINDS_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| config_dir.join("config.toml"));

    println!("ChatMinds — Setup");
    println!("=================\n");

    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        tokio::fs::create_dir_all(parent).await?;
        println!("Created config directory: {}", parent.display());
    }

    if config_path.exists() && !force {
        println!("Config already exists at: {}", config_path.display());
        println!("Edit it manually or re-run with --force.\n");
        return Ok(());
    }

    tokio::fs::write(&config_path, AppConfig::default_toml()).await?;
    println!("Wrote {}", config_path.display());
    println!("\nNext steps:");
    println!("   1. Set GEMINI_API_KEY (or api_key in the file)");
    println!("   2. Run: chatminds serve");
    println!("   3. Or try: chatminds chat -s me -c first \"Hello\"\n");

    Ok(())
}
