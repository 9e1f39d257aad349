// =============================================================================
// text_scanner.rs - TURNING TABLE SOUP INTO BIDS
// =============================================================================
//
// Every source eventually hands us a row of cells. Somewhere in those cells
// is a commodity name, a cash price, a basis, and maybe a futures month.
// Nobody labels them. Column order differs per co-op, per week, per whoever
// last edited the sheet.
//
// So we guess, and we guess the same way every time:
//
// 1. Commodity: Aho-Corasick over the row text for corn / soybean keywords.
//    Popcorn is a different market entirely and poisons the row.
// 2. Numbers: a cell is a number only if the whole cell (minus `$`, commas
//    and spaces) is a signed decimal with at most four places.
// 3. Cash price is the first number between 2 and 20 dollars. Basis is the
//    first other number that is bigger than half a cent, inside +/-200
//    cents, and not itself a plausible cash price.
// 4. Futures month is the first cell that ends in a month and a year.
//
// The ranges are tuned to the corn/soybean market as it is. If corn goes to
// $25 this module will start calling it basis.
// =============================================================================

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;
use std::ops::RangeInclusive;
use std::sync::LazyLock;
use tracing::debug;

use crate::models::{Commodity, Row};

/// Dollars per bushel we are willing to call a cash price.
pub const CASH_PRICE_RANGE: RangeInclusive<f64> = 2.0..=20.0;

/// Cents over/under futures we are willing to call a basis.
pub const BASIS_RANGE: RangeInclusive<f64> = -200.0..=200.0;

/// A basis smaller than this (in absolute cents) is almost always a
/// change column or a rounding artifact.
pub const BASIS_MIN_MAGNITUDE: f64 = 0.5;

const COMMODITY_KEYWORDS: &[&str] = &["popcorn", "corn", "soybean", "soy", "beans"];

static COMMODITY_AUTOMATON: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(COMMODITY_KEYWORDS)
        .expect("Failed to build commodity automaton")
});

static NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:\d+(?:\.\d{1,4})?|\.\d{1,4})$").expect("Failed to compile number pattern")
});

static FUTURES_MONTH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?\s*'?(\d{4}|\d{2})\s*$",
    )
    .expect("Failed to compile futures month pattern")
});

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// The numeric fields pulled out of one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BidFields {
    pub cash_price: Option<f64>,
    pub basis_value: Option<f64>,
    pub futures_month: Option<String>,
}

/// Result of scanning a whole row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowScan {
    pub commodity: Option<Commodity>,
    pub fields: BidFields,
}

/// Scan one row: commodity (hint first, then keywords) and bid fields.
pub fn scan_row(row: &Row) -> RowScan {
    let text = row.text();
    let commodity = row.commodity.or_else(|| classify_commodity(&text));
    let mut fields = if commodity.is_some() {
        extract_bid_fields(&row.cells)
    } else {
        BidFields::default()
    };
    if commodity.is_some() && row.basis.is_some() {
        fields.basis_value = row.basis;
    }

    debug!(
        row = text.as_str(),
        commodity = ?commodity,
        cash_price = ?fields.cash_price,
        basis_value = ?fields.basis_value,
        futures_month = ?fields.futures_month,
        "Row scanned"
    );

    RowScan { commodity, fields }
}

/// Decide which commodity a piece of text is about. Any mention of popcorn
/// disqualifies the text; otherwise the leftmost keyword decides.
pub fn classify_commodity(text: &str) -> Option<Commodity> {
    if !quick_commodity_check(text) {
        return None;
    }

    let mut found = None;
    for m in COMMODITY_AUTOMATON.find_iter(text) {
        match COMMODITY_KEYWORDS[m.pattern().as_usize()] {
            "popcorn" => return None,
            "corn" => {
                found.get_or_insert(Commodity::Corn);
            }
            _ => {
                found.get_or_insert(Commodity::Soybeans);
            }
        }
    }
    found
}

/// Cheap byte scan before the automaton. False means the text cannot
/// possibly name a commodity we track.
/// Case-blind like the automaton, so "CoRn" still gets through.
pub fn quick_commodity_check(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    memchr::memmem::find(bytes, b"orn").is_some()
        || memchr::memmem::find(bytes, b"oy").is_some()
        || memchr::memmem::find(bytes, b"ean").is_some()
}

/// Parse a cell as a number, or refuse. `"$4.05"`, `"-35"`, `"1,234.5"`
/// and `"−12"` (Unicode minus) are numbers; `"Dec 24"` and `"4.12345"` are not.
pub fn parse_number(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .map(|c| if c == '\u{2212}' { '-' } else { c })
        .collect();

    if cleaned.is_empty() || !NUMBER_PATTERN.is_match(&cleaned) {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

fn is_basis_candidate(n: f64) -> bool {
    n.abs() > BASIS_MIN_MAGNITUDE && BASIS_RANGE.contains(&n) && !CASH_PRICE_RANGE.contains(&n)
}

/// Assign cash price, basis and futures month from a row's cells.
pub fn extract_bid_fields(cells: &[String]) -> BidFields {
    let numbers: Vec<f64> = cells.iter().filter_map(|c| parse_number(c)).collect();

    let cash_index = numbers.iter().position(|n| CASH_PRICE_RANGE.contains(n));
    let basis_value = numbers
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != cash_index)
        .map(|(_, n)| *n)
        .find(|n| is_basis_candidate(*n));

    BidFields {
        cash_price: cash_index.map(|i| numbers[i]),
        basis_value,
        futures_month: cells.iter().find_map(|c| parse_futures_month(c)),
    }
}

/// `"Dec 24"`, `"DEC24"`, `"Nov'24"`, `"March 2025"` -> `"Dec 24"`,
/// `"Dec 24"`, `"Nov 24"`, `"Mar 2025"`. The month and year must end the cell.
pub fn parse_futures_month(cell: &str) -> Option<String> {
    let caps = FUTURES_MONTH_PATTERN.captures(cell.trim())?;
    let month = caps.get(1)?.as_str().to_lowercase();
    let year = caps.get(2)?.as_str();
    let label = MONTH_LABELS
        .iter()
        .find(|label| month.starts_with(&label.to_lowercase()))?;
    Some(format!("{} {}", label, year))
}

/// Label for a 1-based month number.
pub fn month_label(month: u32) -> Option<&'static str> {
    MONTH_LABELS.get(month.checked_sub(1)? as usize).copied()
}
