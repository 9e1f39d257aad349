// =============================================================================
// bid_script_scanner.rs - BIDS HIDING IN INLINE JAVASCRIPT
// =============================================================================
//
// Some co-op sites run a vendor bid widget that never puts a <table> in the
// HTML we fetch. Instead the page carries an inline script that draws the
// table at load time, one call per bid:
//
//   writeBidRow('Hampton', 'ZCZ24', 'Oct 24', '4.1250', '-0.4500');
//   writeBidCell('ZSF25', '9.8750', '-0.8500');
//
// writeBidRow names the location; writeBidCell belongs to whichever page we
// fetched. The symbol is a CBOT futures code: ZC is corn, ZS is soybeans,
// then a month letter and a year. Basis is quoted in dollars, so we turn it
// into cents before anyone else sees it.
//
// None of this is documented. If the vendor renames a function, this file
// is the only thing that breaks, and the run log will say "0 rows".
// =============================================================================

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::{Captures, Regex};
use std::sync::LazyLock;
use tracing::debug;

use super::{fetch_text, require_targets, FailurePolicy, SourceAdapter, TargetFetch};
use crate::config::SourceSettings;
use crate::error::SourceError;
use crate::models::{Commodity, LocationTable, PageTarget, RawPage, Row, SourceId};
use crate::run_log::RunLog;
use crate::text_scanner::month_label;

static BID_ROW_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"writeBidRow\(\s*['"](?P<location>[^'"]*)['"]\s*,\s*['"](?P<symbol>[A-Z]{2}[FGHJKMNQUVXZ]\d{1,2})['"]\s*,\s*['"](?P<delivery>[^'"]*)['"]\s*,\s*['"]?(?P<cash>[-+]?\d*\.?\d+)?['"]?\s*,\s*['"]?(?P<basis>[-+]?\d*\.?\d+)?['"]?"#,
    )
    .expect("Failed to compile writeBidRow pattern")
});

static BID_CELL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"writeBidCell\(\s*['"](?P<symbol>[A-Z]{2}[FGHJKMNQUVXZ]\d{1,2})['"]\s*,\s*['"]?(?P<cash>[-+]?\d*\.?\d+)?['"]?\s*,\s*['"]?(?P<basis>[-+]?\d*\.?\d+)?['"]?"#,
    )
    .expect("Failed to compile writeBidCell pattern")
});

/// CBOT month codes, January through December.
const MONTH_CODES: &str = "FGHJKMNQUVXZ";

pub struct BidScriptScanner {
    settings: SourceSettings,
    client: reqwest::Client,
}

impl BidScriptScanner {
    pub fn new(settings: SourceSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }
}

impl SourceAdapter for BidScriptScanner {
    fn id(&self) -> SourceId {
        SourceId::BidScript
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

            let mut fetched = Vec::with_capacity(self.targets().len());
            for target in self.targets() {
                log.info(format!("Fetching bid page for {}", target));
                let result = fetch_text(&self.client, &target.url).await;
                match &result {
                    Ok(html) => log.info(format!(
                        "Received {} bytes, {} bid calls",
                        html.len(),
                        count_bid_calls(html)
                    )),
                    Err(e) => log.warn(format!("Fetch failed for {}: {}", target, e)),
                }
                fetched.push(TargetFetch {
                    target: target.clone(),
                    result: result.map(RawPage::Html),
                });
            }
            Ok(fetched)
        }
        .boxed()
    }

    fn to_rows(&self, page: &RawPage) -> Vec<Row> {
        match page {
            RawPage::Html(html) => extract_bid_rows(html),
            _ => Vec::new(),
        }
    }
}

fn count_bid_calls(html: &str) -> usize {
    memchr::memmem::find_iter(html.as_bytes(), b"writeBid").count()
}

/// Pull every writeBidRow / writeBidCell call for corn or soybeans out of
/// the page, as rows the shared classifier can read.
pub fn extract_bid_rows(html: &str) -> Vec<Row> {
    if memchr::memmem::find(html.as_bytes(), b"writeBid").is_none() {
        return Vec::new();
    }

    let row_calls = BID_ROW_PATTERN.captures_iter(html).filter_map(|caps| {
        let location = caps.name("location")?.as_str().trim();
        let delivery = caps.name("delivery")?.as_str().trim();
        let mut row = bid_row(&caps)?;
        if !location.is_empty() {
            row.location = Some(location.to_string());
        }
        if !delivery.is_empty() {
            row.note = Some(format!("delivery {}", delivery));
        }
        Some(row)
    });
    let cell_calls = BID_CELL_PATTERN.captures_iter(html).filter_map(|caps| bid_row(&caps));

    row_calls.chain(cell_calls).collect()
}

fn bid_row(caps: &Captures<'_>) -> Option<Row> {
    let symbol = caps.name("symbol")?.as_str();
    let Some((commodity, futures_month)) = parse_symbol(symbol) else {
        debug!(symbol = symbol, "Ignoring bid for a commodity we do not track");
        return None;
    };
    // An empty cash or basis argument still yields a row; with no basis the
    // pipeline skips it and says so.
    let cash = caps.name("cash").map_or("", |m| m.as_str());
    let basis = caps
        .name("basis")
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(dollars_to_cents);

    let commodity_label = match commodity {
        Commodity::Corn => "Corn",
        Commodity::Soybeans => "Soybeans",
    };
    Some(Row {
        cells: vec![
            commodity_label.to_string(),
            futures_month,
            cash.to_string(),
            basis.map(|b| b.to_string()).unwrap_or_default(),
        ],
        commodity: Some(commodity),
        location: None,
        basis,
        note: None,
    })
}

/// `ZCZ24` -> (corn, "Dec 24"). One-digit years are read as 202x.
pub fn parse_symbol(symbol: &str) -> Option<(Commodity, String)> {
    let commodity = match symbol.get(..2)? {
        "ZC" => Commodity::Corn,
        "ZS" => Commodity::Soybeans,
        _ => return None,
    };
    let code = symbol.get(2..3)?;
    let month = MONTH_CODES.find(code)? as u32 + 1;
    let year = symbol.get(3..)?;
    let year = match year.len() {
        1 => format!("2{}", year),
        2 => year.to_string(),
        _ => return None,
    };
    Some((commodity, format!("{} {}", month_label(month)?, year)))
}

/// Dollars to cents, rounded to two places to shed float noise.
pub fn dollars_to_cents(dollars: f64) -> f64 {
    (dollars * 100.0 * 100.0).round() / 100.0
}
