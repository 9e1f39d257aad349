// =============================================================================
// scanners/mod.rs - ONE ADAPTER PER CO-OP WEBSITE FLAVOR
// =============================================================================
//
// Four sources, four ways of getting text off the internet:
//
//   sheet        a Google Sheet someone at the co-op keeps updated, as CSV
//   browserless  a bid page rendered by a remote headless browser service
//   chromium     bid pages rendered by a Chromium we launch ourselves
//   bid-script   raw HTML with the bids hiding in writeBidRow(...) calls
//
// Everything after "here are some rows" is shared (see pipeline.rs). An
// adapter only knows how to fetch its targets and how to cut what it
// fetched into rows. When a co-op redesigns its site, exactly one file in
// this directory breaks.
// =============================================================================

pub mod bid_script_scanner;
pub mod browser;
pub mod browserless_scanner;
pub mod chromium_scanner;
pub mod sheet_scanner;

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::SourceError;
use crate::models::{LocationTable, PageTarget, RawPage, Row, SourceId};
use crate::run_log::RunLog;

/// What to do when one target of a source cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The whole run fails (HTTP 500)
    Abort,
    /// Record the failure in `errors` and carry on with the next target
    Collect,
}

/// The outcome of fetching one target.
pub struct TargetFetch {
    pub target: PageTarget,
    pub result: Result<RawPage, SourceError>,
}

pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> SourceId;

    fn targets(&self) -> &[PageTarget];

    fn locations(&self) -> &LocationTable;

    fn failure_policy(&self) -> FailurePolicy;

    /// Fetch every target. An `Err` means nothing could be fetched at all
    /// (the browser would not start, a credential is missing); per-target
    /// failures live inside the returned list.
    fn fetch_raw<'a>(&'a self, log: &'a RunLog)
        -> BoxFuture<'a, Result<Vec<TargetFetch>, SourceError>>;

    fn to_rows(&self, page: &RawPage) -> Vec<Row>;
}

/// Shared HTTP client for the adapters that fetch with plain GETs.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("Mozilla/5.0 (compatible; CashBidEngine/1.0; +basis-tracker)")
        .build()
}

/// GET a URL and return its body, turning non-2xx into an error.
pub async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, SourceError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| SourceError::Request {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    response.text().await.map_err(|source| SourceError::Request {
        url: url.to_string(),
        source,
    })
}

/// Build every adapter from configuration.
pub fn build_adapters(
    config: &Config,
) -> Result<HashMap<SourceId, Arc<dyn SourceAdapter>>, reqwest::Error> {
    let client = http_client(config.fetch_timeout)?;
    let mut adapters: HashMap<SourceId, Arc<dyn SourceAdapter>> = HashMap::new();

    adapters.insert(
        SourceId::Sheet,
        Arc::new(sheet_scanner::SheetScanner::new(
            config.sheet.clone(),
            client.clone(),
        )),
    );
    adapters.insert(
        SourceId::Browserless,
        Arc::new(browserless_scanner::BrowserlessScanner::new(
            config.browserless.clone(),
            config.browserless_ws_url.clone(),
            config.browserless_token.clone(),
            browser::RenderTimings::from_config(config),
        )),
    );
    adapters.insert(
        SourceId::Chromium,
        Arc::new(chromium_scanner::ChromiumScanner::new(
            config.chromium.clone(),
            config.chromium_executable.clone(),
            browser::RenderTimings::from_config(config),
        )),
    );
    adapters.insert(
        SourceId::BidScript,
        Arc::new(bid_script_scanner::BidScriptScanner::new(
            config.bid_script.clone(),
            client,
        )),
    );

    Ok(adapters)
}

/// Shared guard for adapters with nothing configured.
pub fn require_targets(id: SourceId, targets: &[PageTarget]) -> Result<(), SourceError> {
    if targets.is_empty() {
        return Err(SourceError::NotConfigured(id, id.env_prefix()));
    }
    Ok(())
}
