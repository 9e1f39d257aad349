// =============================================================================
// models.rs - THE SHAPES THAT BIDS TAKE
// =============================================================================
//
// Every source ends up producing the same thing: a basis entry. A row of a
// Google Sheet, a table rendered by a headless browser, a writeBidRow() call
// buried in an inline script. They all get squeezed into one record with a
// date, a commodity, an elevator, and a basis number.
//
// The datastore owns the schema. We just promise not to insert the same
// (date, commodity, elevator) twice in one day, and even that promise is
// a pinky swear, not a unique index.
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two crops we care about. Wheat, oats and popcorn need not apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Commodity {
    Corn,
    Soybeans,
}

impl Commodity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commodity::Corn => "corn",
            Commodity::Soybeans => "soybeans",
        }
    }
}

impl fmt::Display for Commodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which scraper produced the data. Doubles as the route segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceId {
    /// Public Google Sheet, exported as CSV
    #[serde(rename = "sheet")]
    Sheet,
    /// Page rendered by the remote headless-browser service
    #[serde(rename = "browserless")]
    Browserless,
    /// Page rendered by the locally bundled Chromium
    #[serde(rename = "chromium")]
    Chromium,
    /// Raw HTML with the bids baked into inline script calls
    #[serde(rename = "bid-script")]
    BidScript,
}

impl SourceId {
    pub const ALL: [SourceId; 4] = [
        SourceId::Sheet,
        SourceId::Browserless,
        SourceId::Chromium,
        SourceId::BidScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Sheet => "sheet",
            SourceId::Browserless => "browserless",
            SourceId::Chromium => "chromium",
            SourceId::BidScript => "bid-script",
        }
    }

    /// Prefix used for the per-source environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            SourceId::Sheet => "CASH_BID_SHEET",
            SourceId::Browserless => "CASH_BID_BROWSERLESS",
            SourceId::Chromium => "CASH_BID_CHROMIUM",
            SourceId::BidScript => "CASH_BID_BID_SCRIPT",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            SourceId::Sheet => 0,
            SourceId::Browserless => 1,
            SourceId::Chromium => 2,
            SourceId::BidScript => 3,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown source '{}'", s))
    }
}

/// One page (or sheet) to fetch, plus the elevator its rows belong to
/// when nothing more specific turns up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageTarget {
    pub elevator_name: String,
    pub url: String,
}

impl fmt::Display for PageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.elevator_name, self.url)
    }
}

/// Ordered alias -> elevator name pairs. Matching is a case-insensitive
/// substring test and the first alias that hits wins, so put the longer
/// aliases first if they overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationTable {
    entries: Vec<(String, String)>,
}

impl LocationTable {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(alias, name)| (alias.trim().to_lowercase(), name.trim().to_string()))
            .filter(|(alias, name)| !alias.is_empty() && !name.is_empty())
            .collect();
        Self { entries }
    }

    pub fn resolve(&self, text: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let lower = text.to_lowercase();
        self.entries
            .iter()
            .find(|(alias, _)| lower.contains(alias.as_str()))
            .map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What an adapter hands back after fetching one target.
#[derive(Debug, Clone)]
pub enum RawPage {
    Csv(String),
    Rendered {
        /// table -> row -> cell text
        tables: Vec<Vec<Vec<String>>>,
        iframes: Vec<String>,
    },
    Html(String),
}

impl RawPage {
    /// A few facts about the page for the `debug` block of the response.
    pub fn debug_summary(&self) -> serde_json::Value {
        match self {
            RawPage::Csv(text) => serde_json::json!({
                "kind": "csv",
                "bytes": text.len(),
                "lines": text.lines().count(),
            }),
            RawPage::Rendered { tables, iframes } => serde_json::json!({
                "kind": "rendered",
                "tables": tables.len(),
                "table_rows": tables.iter().map(|t| t.len()).sum::<usize>(),
                "iframes": iframes,
            }),
            RawPage::Html(text) => serde_json::json!({
                "kind": "html",
                "bytes": text.len(),
            }),
        }
    }
}

/// A tokenized row. The hints are set only by adapters whose markup states
/// the commodity, location or basis outright; everyone else leaves them to
/// the text scanner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub cells: Vec<String>,
    pub commodity: Option<Commodity>,
    pub location: Option<String>,
    /// Basis in cents, bypassing the range heuristic
    pub basis: Option<f64>,
    pub note: Option<String>,
}

impl Row {
    pub fn from_cells(cells: Vec<String>) -> Self {
        Self {
            cells,
            ..Default::default()
        }
    }

    /// Cells joined by a single space, for keyword and location matching.
    pub fn text(&self) -> String {
        self.cells
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The record that lands in the datastore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasisEntry {
    /// `YYYY-MM-DD`, the UTC day of the run
    #[serde(with = "ymd")]
    pub date: NaiveDate,
    pub commodity: Commodity,
    pub elevator_name: String,
    /// Cents over/under futures
    pub basis_value: f64,
    /// Dollars per bushel
    pub cash_price: Option<f64>,
    pub futures_month: Option<String>,
    pub notes: String,
}

impl BasisEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey {
            date: self.date,
            commodity: self.commodity,
            elevator_name: self.elevator_name.clone(),
        }
    }
}

impl fmt::Display for BasisEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @ {}: basis {}",
            self.date, self.commodity, self.elevator_name, self.basis_value
        )?;
        if let Some(cash) = self.cash_price {
            write!(f, ", cash {:.4}", cash)?;
        }
        if let Some(month) = &self.futures_month {
            write!(f, " ({})", month)?;
        }
        Ok(())
    }
}

/// The uniqueness triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub date: NaiveDate,
    pub commodity: Commodity,
    pub elevator_name: String,
}

impl EntryKey {
    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// String form used by the dedup memo. The elevator name is kept exact,
    /// the same way the datastore's `eq.` filter compares it.
    pub fn memo_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.date_string(),
            self.commodity,
            self.elevator_name
        )
    }
}

/// A row that made it past commodity detection but not into the datastore.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SkippedRow {
    pub row: String,
    pub commodity: Option<Commodity>,
    pub elevator_name: Option<String>,
    pub reason: String,
}

/// Everything a run produced, minus the log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeReport {
    pub saved: Vec<BasisEntry>,
    pub skipped: Vec<SkippedRow>,
    pub errors: Vec<String>,
    pub rows_seen: usize,
    pub rows_ignored: usize,
    pub debug: Vec<serde_json::Value>,
}

impl ScrapeReport {
    pub fn message(&self, source: SourceId) -> String {
        format!(
            "{}: {} rows read, {} saved, {} skipped, {} errors",
            source,
            self.rows_seen,
            self.saved.len(),
            self.skipped.len(),
            self.errors.len()
        )
    }
}

mod ymd {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d";

    pub fn serialize<S: Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDate::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> BasisEntry {
        BasisEntry {
            date: NaiveDate::from_ymd_opt(2024, 11, 5).unwrap(),
            commodity: Commodity::Soybeans,
            elevator_name: "Hampton Co-op".to_string(),
            basis_value: -85.0,
            cash_price: Some(9.8750),
            futures_month: Some("Jan 25".to_string()),
            notes: "Auto-scraped".to_string(),
        }
    }

    #[test]
    fn test_entry_serializes_in_datastore_shape() {
        let json = serde_json::to_value(entry()).unwrap();
        assert_eq!(json["date"], "2024-11-05");
        assert_eq!(json["commodity"], "soybeans");
        assert_eq!(json["elevator_name"], "Hampton Co-op");
        assert_eq!(json["basis_value"], -85.0);
        assert_eq!(json["futures_month"], "Jan 25");
    }

    #[test]
    fn test_memo_key_matches_elevator_name_exactly() {
        let mut a = entry();
        let b = entry();
        a.elevator_name = "HAMPTON CO-OP".to_string();
        assert_ne!(a.key().memo_key(), b.key().memo_key());
        assert_eq!(b.key().memo_key(), "2024-11-05:soybeans:Hampton Co-op");
    }

    #[test]
    fn test_source_id_round_trips_route_segment() {
        for id in SourceId::ALL {
            assert_eq!(id.as_str().parse::<SourceId>().unwrap(), id);
        }
        assert!("wheat".parse::<SourceId>().is_err());
    }

    #[test]
    fn test_location_table_first_alias_wins() {
        let table = LocationTable::new(vec![
            ("West Hampton".to_string(), "West Hampton Elevator".to_string()),
            ("hampton".to_string(), "Hampton Co-op".to_string()),
        ]);
        assert_eq!(table.resolve("WEST HAMPTON corn"), Some("West Hampton Elevator"));
        assert_eq!(table.resolve("Hampton soybeans"), Some("Hampton Co-op"));
        assert_eq!(table.resolve("Dows"), None);
    }

    #[test]
    fn test_row_text_skips_empty_cells() {
        let row = Row::from_cells(vec!["Corn".into(), "".into(), " 4.05 ".into(), "".into()]);
        assert_eq!(row.text(), "Corn 4.05");
    }
}
