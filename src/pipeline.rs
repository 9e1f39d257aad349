// =============================================================================
// pipeline.rs - FROM ROWS TO ROWS IN A DATABASE
// =============================================================================
//
// Every source runs through this one function once its adapter has fetched
// something:
//
//   fetched page -> rows -> where is it? -> what crop? -> which numbers?
//   -> already filed today? -> insert
//
// Location is sticky. Co-op tables love a layout like
//
//   Hampton
//   Corn      4.05   -35
//   Soybeans  9.87   -85
//   Dows
//   Corn      4.10   -30
//
// so a row that mentions a known location becomes the location for every
// row after it, until another one shows up. Rows whose markup names the
// location outright (bid-script) skip all that.
//
// Nothing in here throws once the fetch is done. A bad row is skipped, a
// failed insert is an error string, and the run carries on.
// =============================================================================

use chrono::NaiveDate;
use serde_json::{json, Value};

use crate::dedup::DedupEngine;
use crate::error::SourceError;
use crate::models::{
    BasisEntry, LocationTable, PageTarget, RawPage, Row, ScrapeReport, SkippedRow, SourceId,
};
use crate::run_log::RunLog;
use crate::scanners::{FailurePolicy, SourceAdapter, TargetFetch};
use crate::store::BasisStore;
use crate::text_scanner::scan_row;

pub const NO_BASIS_REASON: &str = "Could not identify basis value";

/// Run one source end to end. `Err` only when the run as a whole failed:
/// nothing could be fetched, or an abort-policy target failed.
pub async fn run(
    adapter: &dyn SourceAdapter,
    store: &dyn BasisStore,
    dedup: &DedupEngine,
    today: NaiveDate,
    log: &RunLog,
) -> Result<ScrapeReport, SourceError> {
    let source = adapter.id();
    let mut fetched = adapter.fetch_raw(log).await?;

    // Abort sources write nothing unless every target came back.
    if adapter.failure_policy() == FailurePolicy::Abort {
        if let Some(pos) = fetched.iter().position(|f| f.result.is_err()) {
            let TargetFetch { target, result } = fetched.swap_remove(pos);
            if let Err(e) = result {
                log.error(format!("Aborting run, {} failed: {}", target, e));
                return Err(e);
            }
        }
    }

    let mut report = ScrapeReport::default();
    for TargetFetch { target, result } in fetched {
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                log.error(format!("Skipping {}: {}", target, e));
                report.errors.push(format!("{}: {}", target.elevator_name, e));
                report.debug.push(json!({
                    "target": target.url,
                    "elevator_name": target.elevator_name,
                    "error": e.to_string(),
                }));
                continue;
            }
        };

        let rows = adapter.to_rows(&page);
        log.info(format!("Processing {} rows for {}", rows.len(), target.elevator_name));

        let ignored_before = report.rows_ignored;
        let mut target_run = TargetRun {
            source,
            target: &target,
            locations: adapter.locations(),
            store,
            dedup,
            today,
            log,
            current_location: None,
        };
        for row in &rows {
            report.rows_seen += 1;
            target_run.process(row, &mut report).await;
        }

        report.debug.push(target_debug(
            &target,
            &page,
            rows.len(),
            report.rows_ignored - ignored_before,
        ));
    }

    log.info(report.message(source));
    Ok(report)
}

/// Per-target state while walking its rows.
struct TargetRun<'a> {
    source: SourceId,
    target: &'a PageTarget,
    locations: &'a LocationTable,
    store: &'a dyn BasisStore,
    dedup: &'a DedupEngine,
    today: NaiveDate,
    log: &'a RunLog,
    current_location: Option<String>,
}

impl TargetRun<'_> {
    async fn process(&mut self, row: &Row, report: &mut ScrapeReport) {
        let text = row.text();
        let elevator_name = self.resolve_location(row, &text);

        let scan = scan_row(row);
        let Some(commodity) = scan.commodity else {
            report.rows_ignored += 1;
            return;
        };

        let Some(basis_value) = scan.fields.basis_value else {
            report.skipped.push(SkippedRow {
                row: text,
                commodity: Some(commodity),
                elevator_name: Some(elevator_name),
                reason: NO_BASIS_REASON.to_string(),
            });
            return;
        };

        let entry = BasisEntry {
            date: self.today,
            commodity,
            elevator_name,
            basis_value,
            cash_price: scan.fields.cash_price,
            futures_month: scan.fields.futures_month,
            notes: self.notes_for(row),
        };
        let key = entry.key();

        match self.dedup.check(self.store, &key).await {
            Ok(verdict) if verdict.is_new() => {}
            Ok(_) => {
                report.skipped.push(SkippedRow {
                    row: text,
                    commodity: Some(commodity),
                    elevator_name: Some(entry.elevator_name),
                    reason: format!("Entry already exists for {}", key.date_string()),
                });
                return;
            }
            Err(e) => {
                self.log
                    .error(format!("Existence check failed for {}: {}", entry, e));
                report
                    .errors
                    .push(format!("Existence check failed for {}: {}", entry, e));
                return;
            }
        }

        match self.store.insert(&entry).await {
            Ok(()) => {
                self.dedup.remember(&key);
                self.log.info(format!("Saved {}", entry));
                report.saved.push(entry);
            }
            Err(e) => {
                self.log.error(format!("Insert failed for {}: {}", entry, e));
                report.errors.push(format!("Insert failed for {}: {}", entry, e));
            }
        }
    }

    /// Row hint first (mapped through the table when it can be), then a
    /// table match on the row text, then the last location seen, then the
    /// target's own elevator.
    fn resolve_location(&mut self, row: &Row, text: &str) -> String {
        if let Some(hint) = row.location.as_deref() {
            return self.locations.resolve(hint).unwrap_or(hint).to_string();
        }
        if let Some(name) = self.locations.resolve(text) {
            self.current_location = Some(name.to_string());
            return name.to_string();
        }
        self.current_location
            .clone()
            .unwrap_or_else(|| self.target.elevator_name.clone())
    }

    fn notes_for(&self, row: &Row) -> String {
        let mut notes = format!("Auto-scraped from {} ({})", self.source, self.target.url);
        if let Some(note) = &row.note {
            notes.push_str("; ");
            notes.push_str(note);
        }
        notes
    }
}

fn target_debug(target: &PageTarget, page: &RawPage, rows: usize, ignored: usize) -> Value {
    let mut summary = page.debug_summary();
    if let Value::Object(map) = &mut summary {
        map.insert("target".into(), json!(target.url));
        map.insert("elevator_name".into(), json!(target.elevator_name));
        map.insert("rows".into(), json!(rows));
        map.insert("rows_ignored".into(), json!(ignored));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Commodity;
    use crate::scanners::bid_script_scanner::extract_bid_rows;
    use crate::scanners::sheet_scanner::split_csv_rows;
    use crate::store::MemoryStore;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    /// Serves canned pages. `Err(status)` stands in for a non-2xx fetch.
    struct ScriptedAdapter {
        policy: FailurePolicy,
        targets: Vec<PageTarget>,
        pages: Vec<Result<RawPage, u16>>,
        locations: LocationTable,
    }

    impl ScriptedAdapter {
        fn new(policy: FailurePolicy) -> Self {
            Self {
                policy,
                targets: Vec::new(),
                pages: Vec::new(),
                locations: LocationTable::new(vec![
                    ("hampton".to_string(), "Hampton Co-op".to_string()),
                    ("dows".to_string(), "Dows Elevator".to_string()),
                ]),
            }
        }

        fn page(mut self, elevator: &str, page: Result<RawPage, u16>) -> Self {
            self.targets.push(PageTarget {
                elevator_name: elevator.to_string(),
                url: format!("https://{}.example/bids", elevator.to_lowercase().replace(' ', "-")),
            });
            self.pages.push(page);
            self
        }
    }

    impl SourceAdapter for ScriptedAdapter {
        fn id(&self) -> SourceId {
            SourceId::Sheet
        }

        fn targets(&self) -> &[PageTarget] {
            &self.targets
        }

        fn locations(&self) -> &LocationTable {
            &self.locations
        }

        fn failure_policy(&self) -> FailurePolicy {
            self.policy
        }

        fn fetch_raw<'a>(
            &'a self,
            _log: &'a RunLog,
        ) -> BoxFuture<'a, Result<Vec<TargetFetch>, SourceError>> {
            let fetched = self
                .targets
                .iter()
                .zip(&self.pages)
                .map(|(target, page)| TargetFetch {
                    target: target.clone(),
                    result: page.clone().map_err(|status| SourceError::Status {
                        url: target.url.clone(),
                        status,
                    }),
                })
                .collect();
            async move { Ok(fetched) }.boxed()
        }

        fn to_rows(&self, page: &RawPage) -> Vec<Row> {
            match page {
                RawPage::Csv(text) => split_csv_rows(text).into_iter().map(Row::from_cells).collect(),
                RawPage::Html(html) => extract_bid_rows(html),
                RawPage::Rendered { .. } => Vec::new(),
            }
        }
    }

    const SHEET: &str = "\
Location,Commodity,Cash,Basis,Futures
Hampton,,,,
Corn,Dec 24,4.05,-35,
Popcorn,,12.00,-40,
Soybeans,Jan 25,9.87,,
Dows,,,,
Soybeans,Jan 25,9.87,-85,
";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 11, 5).unwrap()
    }

    async fn run_once(
        adapter: &ScriptedAdapter,
        store: &MemoryStore,
        dedup: &DedupEngine,
    ) -> Result<ScrapeReport, SourceError> {
        let log = RunLog::new(adapter.id());
        run(adapter, store, dedup, today(), &log).await
    }

    #[tokio::test]
    async fn test_sheet_rows_follow_sticky_locations() {
        let adapter = ScriptedAdapter::new(FailurePolicy::Abort)
            .page("Hampton Co-op", Ok(RawPage::Csv(SHEET.to_string())));
        let store = MemoryStore::new();
        let report = run_once(&adapter, &store, &DedupEngine::new(64)).await.unwrap();

        assert_eq!(report.rows_seen, 7);
        assert_eq!(report.rows_ignored, 4);
        assert_eq!(report.saved.len(), 2);
        assert!(report.errors.is_empty());

        let corn = &report.saved[0];
        assert_eq!(corn.commodity, Commodity::Corn);
        assert_eq!(corn.elevator_name, "Hampton Co-op");
        assert_eq!(corn.basis_value, -35.0);
        assert_eq!(corn.cash_price, Some(4.05));
        assert_eq!(corn.futures_month.as_deref(), Some("Dec 24"));
        assert_eq!(corn.notes, "Auto-scraped from sheet (https://hampton-co-op.example/bids)");

        let beans = &report.saved[1];
        assert_eq!(beans.commodity, Commodity::Soybeans);
        assert_eq!(beans.elevator_name, "Dows Elevator");
        assert_eq!(beans.basis_value, -85.0);

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, NO_BASIS_REASON);
        assert_eq!(report.skipped[0].elevator_name.as_deref(), Some("Hampton Co-op"));

        assert_eq!(store.rows().len(), 2);
        assert_eq!(report.debug.len(), 1);
        assert_eq!(report.debug[0]["rows"], 7);
        assert_eq!(report.debug[0]["rows_ignored"], 4);
    }

    #[tokio::test]
    async fn test_second_run_inserts_nothing() {
        let adapter = ScriptedAdapter::new(FailurePolicy::Abort)
            .page("Hampton Co-op", Ok(RawPage::Csv(SHEET.to_string())));
        let store = MemoryStore::new();

        run_once(&adapter, &store, &DedupEngine::new(64)).await.unwrap();
        // Fresh memo, so the datastore has to answer.
        let second = run_once(&adapter, &store, &DedupEngine::new(64)).await.unwrap();

        assert!(second.saved.is_empty());
        assert_eq!(store.rows().len(), 2);
        let existing: Vec<_> = second
            .skipped
            .iter()
            .filter(|s| s.reason == "Entry already exists for 2024-11-05")
            .collect();
        assert_eq!(existing.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_memo_answers_repeat_runs_locally() {
        let adapter = ScriptedAdapter::new(FailurePolicy::Abort)
            .page("Hampton Co-op", Ok(RawPage::Csv(SHEET.to_string())));
        let store = MemoryStore::new();
        let dedup = DedupEngine::new(64);

        run_once(&adapter, &store, &dedup).await.unwrap();
        let calls = store.exists_calls();
        let second = run_once(&adapter, &store, &dedup).await.unwrap();

        assert!(second.saved.is_empty());
        assert_eq!(store.exists_calls(), calls);
    }

    #[tokio::test]
    async fn test_duplicate_rows_within_one_run() {
        let csv = "Corn,4.05,-35\nCorn,4.06,-34\n";
        let adapter = ScriptedAdapter::new(FailurePolicy::Abort)
            .page("Hampton Co-op", Ok(RawPage::Csv(csv.to_string())));
        let store = MemoryStore::new();
        let report = run_once(&adapter, &store, &DedupEngine::new(64)).await.unwrap();

        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.starts_with("Entry already exists"));
    }

    #[tokio::test]
    async fn test_collect_policy_keeps_going_past_a_404() {
        let adapter = ScriptedAdapter::new(FailurePolicy::Collect)
            .page("Gone Elevator", Err(404))
            .page("Dows Elevator", Ok(RawPage::Csv("Corn,4.10,-30\n".to_string())));
        let store = MemoryStore::new();
        let report = run_once(&adapter, &store, &DedupEngine::new(64)).await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Gone Elevator:"));
        assert!(report.errors[0].contains("404"));
        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.saved[0].elevator_name, "Dows Elevator");
        assert_eq!(report.debug[0]["error"].as_str().map(|e| e.contains("404")), Some(true));
    }

    #[tokio::test]
    async fn test_abort_policy_fails_the_run() {
        let adapter = ScriptedAdapter::new(FailurePolicy::Abort)
            .page("Hampton Co-op", Ok(RawPage::Csv("Corn,4.05,-35\n".to_string())))
            .page("Gone Elevator", Err(503));
        let store = MemoryStore::new();
        let result = run_once(&adapter, &store, &DedupEngine::new(64)).await;

        assert!(matches!(result, Err(SourceError::Status { status: 503, .. })));
        // Hampton fetched fine, but nothing is written when the run aborts.
        assert!(store.rows().is_empty());
        assert_eq!(store.exists_calls(), 0);
    }

    #[tokio::test]
    async fn test_insert_failure_is_recorded_and_run_continues() {
        let csv = "Hampton,,\nCorn,4.05,-35\nDows,,\nCorn,4.10,-30\n";
        let adapter = ScriptedAdapter::new(FailurePolicy::Abort)
            .page("Hampton Co-op", Ok(RawPage::Csv(csv.to_string())));
        let store = MemoryStore::new().failing_for("Hampton Co-op");
        let dedup = DedupEngine::new(64);
        let report = run_once(&adapter, &store, &dedup).await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("Hampton Co-op"));
        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.saved[0].elevator_name, "Dows Elevator");
        // A failed insert must not be remembered as stored.
        assert_eq!(dedup.snapshot().remembered, 1);
    }

    #[tokio::test]
    async fn test_bid_script_hints_drive_location_and_notes() {
        let html = r#"<script>
            writeBidRow('Hampton', 'ZCZ24', 'Oct 24', '4.1250', '-0.4500');
            writeBidRow('Stanhope', 'ZSF25', '', '9.8750', '-0.8500');
            writeBidCell('ZSX24', '9.6200', '-1.0500');
        </script>"#;
        let adapter = ScriptedAdapter::new(FailurePolicy::Collect)
            .page("Main Office", Ok(RawPage::Html(html.to_string())));
        let store = MemoryStore::new();
        let report = run_once(&adapter, &store, &DedupEngine::new(64)).await.unwrap();

        assert_eq!(report.saved.len(), 3);
        let names: Vec<_> = report.saved.iter().map(|e| e.elevator_name.as_str()).collect();
        assert_eq!(names, vec!["Hampton Co-op", "Stanhope", "Main Office"]);

        let corn = &report.saved[0];
        assert_eq!(corn.basis_value, -45.0);
        assert_eq!(corn.cash_price, Some(4.125));
        assert_eq!(corn.futures_month.as_deref(), Some("Dec 24"));
        assert!(corn.notes.ends_with("; delivery Oct 24"));
    }

    #[tokio::test]
    async fn test_bid_call_with_empty_basis_is_skipped_with_reason() {
        let html = r#"<script>
            writeBidRow('Hampton', 'ZCZ24', 'Oct 24', '4.1000', '');
            writeBidRow('Dows', 'ZSF25', '', '9.8750', '-0.8500');
        </script>"#;
        let adapter = ScriptedAdapter::new(FailurePolicy::Collect)
            .page("Main Office", Ok(RawPage::Html(html.to_string())));
        let store = MemoryStore::new();
        let report = run_once(&adapter, &store, &DedupEngine::new(64)).await.unwrap();

        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.saved[0].elevator_name, "Dows Elevator");
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, NO_BASIS_REASON);
        assert_eq!(report.skipped[0].commodity, Some(Commodity::Corn));
        assert_eq!(report.skipped[0].elevator_name.as_deref(), Some("Hampton Co-op"));
        assert!(report.skipped[0].row.contains("4.1000"));
    }

    #[test]
    fn test_resolve_location_prefers_hint_then_table_then_sticky() {
        let locations = LocationTable::new(vec![("hampton".to_string(), "Hampton Co-op".to_string())]);
        let target = PageTarget {
            elevator_name: "Default".to_string(),
            url: "https://coop.example".to_string(),
        };
        let store = MemoryStore::new();
        let dedup = DedupEngine::new(4);
        let log = RunLog::new(SourceId::Sheet);
        let mut run = TargetRun {
            source: SourceId::Sheet,
            target: &target,
            locations: &locations,
            store: &store,
            dedup: &dedup,
            today: today(),
            log: &log,
            current_location: None,
        };

        let plain = Row::from_cells(vec!["Corn".into(), "4.05".into(), "-35".into()]);
        assert_eq!(run.resolve_location(&plain, &plain.text()), "Default");

        let header = Row::from_cells(vec!["HAMPTON".into()]);
        assert_eq!(run.resolve_location(&header, &header.text()), "Hampton Co-op");
        assert_eq!(run.resolve_location(&plain, &plain.text()), "Hampton Co-op");

        let hinted = Row {
            location: Some("Dows".to_string()),
            ..plain.clone()
        };
        assert_eq!(run.resolve_location(&hinted, &hinted.text()), "Dows");
        assert_eq!(run.current_location.as_deref(), Some("Hampton Co-op"));
    }
}
