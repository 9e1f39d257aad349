// =============================================================================
// browser.rs - DRIVING A HEADLESS CHROME AROUND CO-OP WEBSITES
// =============================================================================
//
// Two of our sources only show their bids after a pile of JavaScript has
// fetched them from a third-party widget. For those we need a real browser:
// either one rented from a remote service over a CDP websocket, or one we
// launch ourselves. After that point they behave identically, so the shared
// part lives here:
//
// 1. open the target in a new tab and wait for the load event
// 2. wait for the network to go quiet (the resource-timing count stops
//    growing across a few polls)
// 3. wait a fixed settle delay, because some widgets draw after their last
//    request completes
// 4. pull every <table>'s rows and every <iframe>'s src out with one
//    in-page DOM query
//
// A session is closed on every exit path. The adapters open it, hand it to
// render_targets (which never bails early with `?`), and close it whatever
// came back. If something panics in between, the session is dropped: the
// CDP handler task is aborted and the Browser kills a launched child.
// =============================================================================

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::{Handler, Page};
use futures::StreamExt;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{FailurePolicy, TargetFetch};
use crate::config::Config;
use crate::error::SourceError;
use crate::models::{PageTarget, RawPage, Row};
use crate::run_log::RunLog;

/// Consecutive polls with an unchanged resource count before we call the
/// network idle.
const IDLE_STABLE_POLLS: u32 = 3;

const EXTRACT_DOM_JS: &str = r#"
(() => {
  const clean = (s) => (s || '').replace(/\s+/g, ' ').trim();
  const tables = Array.from(document.querySelectorAll('table')).map((table) =>
    Array.from(table.querySelectorAll('tr')).map((tr) =>
      Array.from(tr.querySelectorAll('th, td')).map((cell) => clean(cell.innerText))
    )
  );
  const iframes = Array.from(document.querySelectorAll('iframe'))
    .map((frame) => frame.getAttribute('src') || '')
    .filter((src) => src.length > 0);
  return { tables, iframes };
})()
"#;

const RESOURCE_COUNT_JS: &str = "performance.getEntriesByType('resource').length";

#[derive(Debug, Clone, Copy)]
pub struct RenderTimings {
    /// Budget for the load event, and separately for network idle
    pub navigation_timeout: Duration,
    pub settle_delay: Duration,
    pub idle_poll: Duration,
}

impl RenderTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            navigation_timeout: config.navigation_timeout,
            settle_delay: config.widget_settle_delay,
            idle_poll: Duration::from_millis(500),
        }
    }
}

/// What the in-page query returns.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DomSnapshot {
    #[serde(default)]
    pub tables: Vec<Vec<Vec<String>>>,
    #[serde(default)]
    pub iframes: Vec<String>,
}

pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    launched: bool,
}

impl BrowserSession {
    /// Start a local headless Chromium.
    pub async fn launch(
        executable: Option<&Path>,
        request_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .request_timeout(request_timeout);
        if let Some(path) = executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(SourceError::Launch)?;

        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|e| SourceError::Launch(e.to_string()))?;
        Ok(Self::spawn(browser, handler, true))
    }

    /// Attach to a remote browser over its CDP websocket.
    pub async fn connect(ws_url: &str) -> Result<Self, SourceError> {
        let (browser, handler) = Browser::connect(ws_url)
            .await
            .map_err(|e| SourceError::Launch(format!("could not connect to browser service: {}", e)))?;
        Ok(Self::spawn(browser, handler, false))
    }

    fn spawn(browser: Browser, mut handler: Handler, launched: bool) -> Self {
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        Self {
            browser,
            handler,
            launched,
        }
    }

    /// Load one target and snapshot its tables and iframes.
    pub async fn render(
        &self,
        target: &PageTarget,
        timings: &RenderTimings,
    ) -> Result<RawPage, SourceError> {
        let url = target.url.as_str();
        let browser_error = |e: &dyn std::fmt::Display| SourceError::Browser {
            url: url.to_string(),
            message: e.to_string(),
        };

        let page = tokio::time::timeout(timings.navigation_timeout, async {
            let page = self.browser.new_page(url).await?;
            page.wait_for_navigation().await?;
            Ok::<Page, chromiumoxide::error::CdpError>(page)
        })
        .await
        .map_err(|_| SourceError::NavigationTimeout {
            url: url.to_string(),
            secs: timings.navigation_timeout.as_secs(),
        })?
        .map_err(|e| browser_error(&e))?;

        let idle = wait_for_network_idle(&page, timings).await;
        debug!(url = url, network_idle = idle, "Page loaded");
        tokio::time::sleep(timings.settle_delay).await;

        let snapshot = match page.evaluate(EXTRACT_DOM_JS).await {
            Ok(result) => result
                .into_value::<DomSnapshot>()
                .map_err(|e| browser_error(&e)),
            Err(e) => Err(browser_error(&e)),
        };
        let _ = page.close().await;

        let snapshot = snapshot?;
        Ok(RawPage::Rendered {
            iframes: resolve_iframes(url, &snapshot.iframes),
            tables: snapshot.tables,
        })
    }

    pub async fn close(mut self, log: &RunLog) {
        if let Err(e) = self.browser.close().await {
            log.warn(format!("Browser did not close cleanly: {}", e));
        }
        if self.launched {
            let _ = self.browser.wait().await;
        }
        log.info("Browser session closed");
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// Render each target in turn. Failures are returned, not thrown; under
/// the abort policy there is no point rendering past the first one.
pub async fn render_targets(
    session: &BrowserSession,
    targets: &[PageTarget],
    timings: &RenderTimings,
    policy: FailurePolicy,
    log: &RunLog,
) -> Vec<TargetFetch> {
    let mut fetched = Vec::with_capacity(targets.len());
    for target in targets {
        log.info(format!("Rendering {}", target));
        let result = session.render(target, timings).await;
        match &result {
            Ok(RawPage::Rendered { tables, iframes }) => log.info(format!(
                "Found {} tables and {} iframes",
                tables.len(),
                iframes.len()
            )),
            Ok(_) => {}
            Err(e) => log.warn(format!("Render failed for {}: {}", target, e)),
        }
        let failed = result.is_err();
        fetched.push(TargetFetch {
            target: target.clone(),
            result,
        });
        if failed && policy == FailurePolicy::Abort {
            break;
        }
    }
    fetched
}

/// Returns false if the deadline passed before the page went quiet.
async fn wait_for_network_idle(page: &Page, timings: &RenderTimings) -> bool {
    let deadline = Instant::now() + timings.navigation_timeout;
    let mut last_count: Option<u64> = None;
    let mut stable_polls = 0;

    while Instant::now() < deadline {
        let count = match page.evaluate(RESOURCE_COUNT_JS).await {
            Ok(result) => result.into_value::<u64>().ok(),
            Err(_) => None,
        };
        if count.is_some() && count == last_count {
            stable_polls += 1;
            if stable_polls >= IDLE_STABLE_POLLS {
                return true;
            }
        } else {
            stable_polls = 0;
        }
        last_count = count;
        tokio::time::sleep(timings.idle_poll).await;
    }
    false
}

/// Make iframe sources absolute against the page URL and drop duplicates
/// and `about:blank`-style noise.
pub fn resolve_iframes(page_url: &str, srcs: &[String]) -> Vec<String> {
    let base = url::Url::parse(page_url).ok();
    let mut resolved: Vec<String> = Vec::new();
    for src in srcs {
        let absolute = match &base {
            Some(base) => base.join(src.trim()).map(|u| u.to_string()).ok(),
            None => url::Url::parse(src.trim()).map(|u| u.to_string()).ok(),
        };
        if let Some(absolute) = absolute {
            if absolute.starts_with("http") && !resolved.contains(&absolute) {
                resolved.push(absolute);
            }
        }
    }
    resolved
}

/// Flatten rendered tables into rows, dropping rows with no text.
pub fn rows_from_tables(tables: &[Vec<Vec<String>>]) -> Vec<Row> {
    tables
        .iter()
        .flatten()
        .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
        .map(|cells| Row::from_cells(cells.clone()))
        .collect()
}
