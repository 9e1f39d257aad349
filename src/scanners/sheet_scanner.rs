// =============================================================================
// sheet_scanner.rs - THE CO-OP'S GOOGLE SHEET
// =============================================================================
//
// Some co-ops publish bids by typing them into a Google Sheet and sharing
// the CSV export link. It is the most reliable source we have, right up
// until someone merges two cells for a holiday banner.
//
// The export is ordinary CSV with the usual surprises: quoted cells with
// commas in them ("$1,234.50"), trailing empty columns, blank spacer rows,
// and sometimes a byte-order mark. The csv crate handles the quoting; we
// drop the blank rows.
// =============================================================================

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use super::{fetch_text, require_targets, FailurePolicy, SourceAdapter, TargetFetch};
use crate::config::SourceSettings;
use crate::error::SourceError;
use crate::models::{LocationTable, PageTarget, RawPage, Row, SourceId};
use crate::run_log::RunLog;

pub struct SheetScanner {
    settings: SourceSettings,
    client: reqwest::Client,
}

impl SheetScanner {
    pub fn new(settings: SourceSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }
}

impl SourceAdapter for SheetScanner {
    fn id(&self) -> SourceId {
        SourceId::Sheet
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

            let mut fetched = Vec::with_capacity(self.targets().len());
            for target in self.targets() {
                log.info(format!("Fetching sheet CSV for {}", target));
                let result = fetch_text(&self.client, &target.url).await;
                if let Ok(text) = &result {
                    log.info(format!("Received {} bytes of CSV", text.len()));
                }
                fetched.push(TargetFetch {
                    target: target.clone(),
                    result: result.map(RawPage::Csv),
                });
            }
            Ok(fetched)
        }
        .boxed()
    }

    fn to_rows(&self, page: &RawPage) -> Vec<Row> {
        match page {
            RawPage::Csv(text) => split_csv_rows(text)
                .into_iter()
                .map(Row::from_cells)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Quote-aware, whitespace-trimming CSV split. Rows may have any number of
/// cells; rows with nothing but empty cells are dropped.
pub fn split_csv_rows(text: &str) -> Vec<Vec<String>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    reader
        .records()
        .filter_map(|record| match record {
            Ok(record) => Some(record.iter().map(str::to_string).collect::<Vec<_>>()),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable CSV record");
                None
            }
        })
        .filter(|cells| cells.iter().any(|c| !c.is_empty()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_keeps_empty_cells_in_place() {
        let rows = split_csv_rows("Corn,,4.05,,-35,,\n");
        assert_eq!(rows, vec![vec!["Corn", "", "4.05", "", "-35", "", ""]]);
    }

    #[test]
    fn test_split_handles_quotes_and_whitespace() {
        let rows = split_csv_rows("\"Soybeans, #1 yellow\",\"$1,012.50\",  -85 \n");
        assert_eq!(rows, vec![vec!["Soybeans, #1 yellow", "$1,012.50", "-85"]]);
    }

    #[test]
    fn test_split_drops_blank_rows_and_bom() {
        let rows = split_csv_rows("\u{feff}Location,Cash,Basis\n,,\n\nHampton,,\nCorn,4.05,-35\n");
        assert_eq!(
            rows,
            vec![
                vec!["Location", "Cash", "Basis"],
                vec!["Hampton", "", ""],
                vec!["Corn", "4.05", "-35"],
            ]
        );
    }

    #[test]
    fn test_to_rows_ignores_other_page_kinds() {
        let scanner = SheetScanner::new(SourceSettings::default(), reqwest::Client::new());
        assert!(scanner.to_rows(&RawPage::Html("<table></table>".into())).is_empty());
        assert_eq!(scanner.to_rows(&RawPage::Csv("Corn,4.05,-35".into())).len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_without_targets_is_not_configured() {
        let scanner = SheetScanner::new(SourceSettings::default(), reqwest::Client::new());
        let log = RunLog::new(SourceId::Sheet);
        let result = scanner.fetch_raw(&log).await;
        assert!(matches!(result, Err(SourceError::NotConfigured(SourceId::Sheet, _))));
    }
}
