// =============================================================================
// config.rs - KNOBS, URLS AND LOCATION TABLES
// =============================================================================
//
// Everything that used to be hardcoded per handler lives here now: which
// pages to scrape, which elevator each page belongs to, how row text maps
// onto elevator names, and how long to wait for a co-op's website to finish
// drawing its bid widget.
//
// All values come from environment variables (a `.env` file is read first
// if there is one). Credentials and targets have no defaults: a source with
// no targets answers with a clear error instead of scraping someone's demo
// page.
//
// Targets and location tables use the same `left=right;left=right` format:
//
//   CASH_BID_CHROMIUM_TARGETS="Hampton Co-op=https://coop.example/bids;Dows Elevator=https://coop.example/dows"
//   CASH_BID_SHEET_LOCATIONS="hampton=Hampton Co-op;dows=Dows Elevator"
// =============================================================================

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::models::{LocationTable, PageTarget, SourceId};

#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // HTTP SERVER
    // =========================================================================
    /// Address the handlers listen on. Default: 0.0.0.0:8080
    pub listen_addr: String,

    // =========================================================================
    // DATASTORE
    // =========================================================================
    /// Supabase project URL. Unset means every run fails with a 500.
    pub supabase_url: Option<String>,

    /// Service or anon key with insert rights on the table.
    pub supabase_key: Option<String>,

    /// Table holding basis entries. Default: basis_entries
    pub basis_table: String,

    // =========================================================================
    // HEADLESS BROWSERS
    // =========================================================================
    /// Websocket endpoint of the remote browser service; the token is
    /// appended as `?token=`.
    pub browserless_ws_url: String,

    pub browserless_token: Option<String>,

    /// Explicit Chromium binary. Unset means let the launcher find one.
    pub chromium_executable: Option<PathBuf>,

    // =========================================================================
    // TIMEOUTS
    // =========================================================================
    /// Plain HTTP fetches (CSV, bid-script HTML, datastore). Default: 15s
    pub fetch_timeout: Duration,

    /// Page load plus network idle in a browser. Default: 30s
    pub navigation_timeout: Duration,

    /// Extra wait after the page goes quiet, for client-side bid widgets.
    /// Default: 5000ms
    pub widget_settle_delay: Duration,

    // =========================================================================
    // DEDUP
    // =========================================================================
    /// Keys remembered as already stored. Default: 10000
    pub lru_cache_size: usize,

    // =========================================================================
    // SOURCES
    // =========================================================================
    pub sheet: SourceSettings,
    pub browserless: SourceSettings,
    pub chromium: SourceSettings,
    pub bid_script: SourceSettings,
}

/// Per-source targets and location aliases.
#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub targets: Vec<PageTarget>,
    pub locations: LocationTable,
}

impl SourceSettings {
    fn from_env(source: SourceId) -> Self {
        let prefix = source.env_prefix();
        let targets = env::var(format!("{}_TARGETS", prefix))
            .map(|raw| parse_targets(&raw))
            .unwrap_or_default();
        let locations = env::var(format!("{}_LOCATIONS", prefix))
            .map(|raw| LocationTable::new(parse_pairs(&raw)))
            .unwrap_or_default();
        Self { targets, locations }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Config {
            listen_addr: env_or_default("CASH_BID_LISTEN_ADDR", "0.0.0.0:8080"),

            supabase_url: env_opt("CASH_BID_SUPABASE_URL"),
            supabase_key: env_opt("CASH_BID_SUPABASE_KEY"),
            basis_table: env_or_default("CASH_BID_TABLE", "basis_entries"),

            browserless_ws_url: env_or_default(
                "CASH_BID_BROWSERLESS_WS_URL",
                "wss://production-sfo.browserless.io",
            ),
            browserless_token: env_opt("CASH_BID_BROWSERLESS_TOKEN"),
            chromium_executable: env_opt("CASH_BID_CHROMIUM_PATH").map(PathBuf::from),

            fetch_timeout: Duration::from_secs(
                env_or_default("CASH_BID_FETCH_TIMEOUT_SECS", "15").parse().unwrap_or(15),
            ),
            navigation_timeout: Duration::from_secs(
                env_or_default("CASH_BID_NAVIGATION_TIMEOUT_SECS", "30").parse().unwrap_or(30),
            ),
            widget_settle_delay: Duration::from_millis(
                env_or_default("CASH_BID_WIDGET_SETTLE_MS", "5000").parse().unwrap_or(5000),
            ),

            lru_cache_size: env_or_default("CASH_BID_LRU_CACHE_SIZE", "10000")
                .parse()
                .unwrap_or(10_000),

            sheet: SourceSettings::from_env(SourceId::Sheet),
            browserless: SourceSettings::from_env(SourceId::Browserless),
            chromium: SourceSettings::from_env(SourceId::Chromium),
            bid_script: SourceSettings::from_env(SourceId::BidScript),
        }
    }

    pub fn source(&self, id: SourceId) -> &SourceSettings {
        match id {
            SourceId::Sheet => &self.sheet,
            SourceId::Browserless => &self.browserless,
            SourceId::Chromium => &self.chromium,
            SourceId::BidScript => &self.bid_script,
        }
    }
}

/// Split `left=right;left=right` into trimmed pairs. Only the first `=`
/// separates, so URLs with query strings survive on the right-hand side.
pub fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| match chunk.split_once('=') {
            Some((left, right)) if !left.trim().is_empty() && !right.trim().is_empty() => {
                Some((left.trim().to_string(), right.trim().to_string()))
            }
            _ => {
                warn!(entry = chunk, "Ignoring malformed config pair (expected left=right)");
                None
            }
        })
        .collect()
}

/// `Elevator Name=https://...` pairs; entries whose right side is not an
/// http(s) URL are dropped.
pub fn parse_targets(raw: &str) -> Vec<PageTarget> {
    parse_pairs(raw)
        .into_iter()
        .filter_map(|(elevator_name, url)| match url::Url::parse(&url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Some(PageTarget {
                elevator_name,
                url,
            }),
            _ => {
                warn!(elevator = elevator_name.as_str(), url = url.as_str(), "Ignoring target with invalid URL");
                None
            }
        })
        .collect()
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
