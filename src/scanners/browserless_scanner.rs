// =============================================================================
// browserless_scanner.rs - RENTING A BROWSER BY THE MINUTE
// =============================================================================
//
// For the co-op whose bid page is a blank div until a third-party widget
// finishes loading, and where we would rather not ship Chromium ourselves,
// we borrow one from a hosted headless-browser service. It speaks plain CDP
// over a websocket; the API token rides along as a query parameter.
//
// One target is the normal setup. Any failure aborts the run, since a
// half-rendered page tells us nothing useful.
// =============================================================================

use futures::future::BoxFuture;
use futures::FutureExt;

use super::browser::{render_targets, rows_from_tables, BrowserSession, RenderTimings};
use super::{require_targets, FailurePolicy, SourceAdapter, TargetFetch};
use crate::config::SourceSettings;
use crate::error::SourceError;
use crate::models::{LocationTable, PageTarget, RawPage, Row, SourceId};
use crate::run_log::RunLog;

pub struct BrowserlessScanner {
    settings: SourceSettings,
    ws_url: String,
    token: Option<String>,
    timings: RenderTimings,
}

impl BrowserlessScanner {
    pub fn new(
        settings: SourceSettings,
        ws_url: String,
        token: Option<String>,
        timings: RenderTimings,
    ) -> Self {
        Self {
            settings,
            ws_url,
            token,
            timings,
        }
    }

    fn endpoint(&self) -> Result<String, SourceError> {
        let token = self
            .token
            .as_deref()
            .ok_or(SourceError::MissingCredential("CASH_BID_BROWSERLESS_TOKEN"))?;
        connect_url(&self.ws_url, token)
    }
}

/// `wss://host/path` + token -> `wss://host/path?token=...`, keeping any
/// query parameters already present.
pub fn connect_url(ws_url: &str, token: &str) -> Result<String, SourceError> {
    let mut url = url::Url::parse(ws_url)
        .map_err(|e| SourceError::Launch(format!("invalid browser service URL '{}': {}", ws_url, e)))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}

impl SourceAdapter for BrowserlessScanner {
    fn id(&self) -> SourceId {
        SourceId::Browserless
    }

    fn targets(&self) -> &[PageTarget] {
        &self.settings.targets
    }

    fn locations(&self) -> &LocationTable {
        &self.settings.locations
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    fn fetch_raw<'a>(
        &'a self,
        log: &'a RunLog,
    ) -> BoxFuture<'a, Result<Vec<TargetFetch>, SourceError>> {
        async move {
            require_targets(self.id(), self.targets())?;
            let endpoint = self.endpoint()?;

            log.info("Connecting to remote browser service");
            let session = BrowserSession::connect(&endpoint).await?;
            let fetched = render_targets(
                &session,
                self.targets(),
                &self.timings,
                self.failure_policy(),
                log,
            )
            .await;
            session.close(log).await;

            Ok(fetched)
        }
        .boxed()
    }

    fn to_rows(&self, page: &RawPage) -> Vec<Row> {
        match page {
            RawPage::Rendered { tables, .. } => rows_from_tables(tables),
            _ => Vec::new(),
        }
    }
}
