//! `parley doctor` — Diagnose configuration and connectivity.

use std::path::Path;

use parley_channels::TelegramChannel;
use parley_core::provider::Provider;
use parley_core::store::TurnStore;
use parley_providers::OpenAiCompatProvider;

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    println!("🩺 Parley Doctor — System Diagnostics");
    println!("====================================\n");

    let mut issues = 0;

    let config = match super::load_config(config_path) {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  ⚠️  Fix the configuration before running further checks.");
            return Ok(());
        }
    };

    match OpenAiCompatProvider::from_config(&config.provider) {
        Ok(provider) => match provider.health_check().await {
            Ok(true) => println!("  ✅ Model backend reachable ({})", config.provider.base_url),
            Ok(false) => {
                println!("  ❌ Model backend rejected the API key");
                issues += 1;
            }
            Err(e) => {
                println!("  ❌ Model backend unreachable: {e}");
                issues += 1;
            }
        },
        Err(e) => {
            println!("  ❌ Model backend not configured: {e}");
            issues += 1;
        }
    }

    if config.tools.tavily_api_key.is_some() {
        println!("  ✅ Web search key configured");
    } else {
        println!("  ⚠️  No TAVILY_API_KEY — web search and page extraction are unavailable");
        issues += 1;
    }

    match TelegramChannel::new(&config.telegram, config.render.max_payload_chars) {
        Ok(channel) => match channel.username().await {
            Ok(username) => println!("  ✅ Telegram bot @{username}"),
            Err(e) => {
                println!("  ❌ Telegram getMe failed: {e}");
                issues += 1;
            }
        },
        Err(e) => {
            println!("  ⚠️  Telegram not configured: {e}");
            issues += 1;
        }
    }

    match super::open_store(&config).await {
        Ok(store) => match store.health_check().await {
            Ok(true) => println!("  ✅ Turn store ready ({})", config.store.database_url),
            Ok(false) | Err(_) => {
                println!("  ❌ Turn store failed its health check");
                issues += 1;
            }
        },
        Err(e) => {
            println!("  ❌ Turn store unavailable: {e:#}");
            issues += 1;
        }
    }

    if config.access.allowed_users.is_empty() && config.access.admin_ids.is_empty() {
        println!("  ⚠️  No allowed users or admins — the bot will refuse everyone");
        issues += 1;
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
