//  ██████╗ █████╗ ███████╗██╗  ██╗    ██████╗ ██╗██████╗
// ██╔════╝██╔══██╗██╔════╝██║  ██║    ██╔══██╗██║██╔══██╗
// ██║     ███████║███████╗███████║    ██████╔╝██║██║  ██║
// ██║     ██╔══██║╚════██║██╔══██║    ██╔══██╗██║██║  ██║
// ╚██████╗██║  ██║███████║██║  ██║    ██████╔╝██║██████╔╝
//  ╚═════╝╚═╝  ╚═╝╚══════╝╚═╝  ╚═╝    ╚═════╝ ╚═╝╚═════╝
//
// E N G I N E
//
// Scrapes corn and soybean cash bids off co-op websites and files one
// basis entry per elevator per crop per day. A cron job hits
// /api/scrape/<source>; everything else is a consequence of that.

mod config;
mod dedup;
mod error;
mod metrics;
mod models;
mod pipeline;
mod run_log;
mod scanners;
mod server;
mod store;
mod text_scanner;

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::dedup::DedupEngine;
use crate::metrics::MetricsCollector;
use crate::models::SourceId;
use crate::server::AppState;
use crate::store::{BasisStore, SupabaseStore};

fn print_banner(config: &Config) {
    let banner = r#"
    ╔══════════════════════════════════════════════════════════════╗
    ║                   CASH BID ENGINE                            ║
    ║                                                              ║
    ║   Sources:  sheet | browserless | chromium | bid-script      ║
    ║   Dedup:    LRU memo + datastore existence check             ║
    ║   Scanning: Aho-Corasick keywords, range heuristics          ║
    ╚══════════════════════════════════════════════════════════════╝
    "#;
    println!("{}", banner);
    for id in SourceId::ALL {
        let settings = config.source(id);
        println!(
            "    {:<12} {} targets, {} location aliases",
            id.as_str(),
            settings.targets.len(),
            settings.locations.len()
        );
    }
    println!();
}

/// Human-readable lines by default; `CASH_BID_LOG_FORMAT=json` for log shippers.
/// Runs before `.env` is loaded, so both this and `RUST_LOG` must come from
/// the real environment.
fn init_tracing() {
    let builder = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let json = std::env::var("CASH_BID_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env();
    print_banner(&config);
    info!("🌽 CASH BID ENGINE initializing...");

    let store: Option<Arc<dyn BasisStore>> = match (&config.supabase_url, &config.supabase_key) {
        (Some(url), Some(key)) => {
            let store = SupabaseStore::new(url, key, &config.basis_table, config.fetch_timeout)
                .context("building datastore client")?;
            Some(Arc::new(store) as Arc<dyn BasisStore>)
        }
        _ => {
            warn!("⚠️  CASH_BID_SUPABASE_URL / CASH_BID_SUPABASE_KEY not set; every scrape will answer 500");
            None
        }
    };

    let adapters = scanners::build_adapters(&config).context("building source adapters")?;
    for id in SourceId::ALL {
        if config.source(id).targets.is_empty() {
            warn!(source = %id, "No targets configured (set {}_TARGETS)", id.env_prefix());
        }
    }

    let state = AppState {
        adapters: Arc::new(adapters),
        store,
        dedup: Arc::new(DedupEngine::new(config.lru_cache_size)),
        metrics: Arc::new(MetricsCollector::new()),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    info!("═══════════════════════════════════════════════════════");
    info!("  🟢 Listening on http://{}", config.listen_addr);
    info!("  📡 GET /api/scrape/<source>   /health   /metrics");
    info!("  ⚡ Press Ctrl+C for graceful shutdown");
    info!("═══════════════════════════════════════════════════════");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server")?;

    info!("💤 CASH BID ENGINE: OFFLINE");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => warn!("🛑 Shutdown signal received!"),
        Err(err) => error!("❌ Signal listener error: {}", err),
    }
}
