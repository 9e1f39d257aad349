// =============================================================================
// chromium_scanner.rs - OUR OWN HEADLESS CHROMIUM
// =============================================================================
//
// Same job as the remote browser service, but with a Chromium binary that
// ships next to us. This source usually covers several location pages of
// one co-op, so a page that times out is written down in `errors` and the
// remaining pages still get scraped. If the browser will not even start,
// there is nothing to collect and the run fails.
// =============================================================================

use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::PathBuf;

use super::browser::{render_targets, rows_from_tables, BrowserSession, RenderTimings};
use super::{require_targets, FailurePolicy, SourceAdapter, TargetFetch};
use crate::config::SourceSettings;
use crate::error::SourceError;
use crate::models::{LocationTable, PageTarget, RawPage, Row, SourceId};
use crate::run_log::RunLog;

pub struct ChromiumScanner {
    settings: SourceSettings,
    executable: Option<PathBuf>,
    timings: RenderTimings,
}

impl ChromiumScanner {
    pub fn new(
        settings: SourceSettings,
        executable: Option<PathBuf>,
        timings: RenderTimings,
    ) -> Self {
        Self {
            settings,
            executable,
            timings,
        }
    }
}

impl SourceAdapter for ChromiumScanner {
    fn id(&self) -> SourceId {
        SourceId::Chromium
    }

    fn targets(&self) -> &[PageTarget] {
        &self.settings.targets
    }

    fn locations(&self) -> &LocationTable {
        &self.settings.locations
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Collect
    }

    fn fetch_raw<'a>(
        &'a self,
        log: &'a RunLog,
    ) -> BoxFuture<'a, Result<Vec<TargetFetch>, SourceError>> {
        async move {
            require_targets(self.id(), self.targets())?;

            log.info(match &self.executable {
                Some(path) => format!("Launching Chromium from {}", path.display()),
                None => "Launching bundled Chromium".to_string(),
            });
            let session =
                BrowserSession::launch(self.executable.as_deref(), self.timings.navigation_timeout)
                    .await?;
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
