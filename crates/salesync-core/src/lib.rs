//! Canonical sales model and the high-water-mark admission rule.

use std::cmp::Ordering;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "salesync-core";

/// Text form of `occurred_at` in the canonical file and in logs.
pub const OCCURRED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Label the portal puts on its synthetic aggregate row.
pub const AGGREGATE_ROW_LABEL: &str = "TOTALI";

/// Canonical file header, in column order.
pub const CANONICAL_HEADERS: [&str; 11] = [
    "Order_ID",
    "Seller",
    "Buyer_Name",
    "Buyer_NIPT",
    "Article_Name",
    "Category",
    "Quantity",
    "Article_Price",
    "Total_Article_Price",
    "Datetime",
    "Seller Category",
];

/// One canonical sales line, ready for storage.
///
/// Serde names match the canonical file header and the column names of the
/// `sales` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesRecord {
    #[serde(rename = "Order_ID")]
    pub order_id: String,
    #[serde(rename = "Seller")]
    pub seller: String,
    #[serde(rename = "Buyer_Name")]
    pub buyer_name: Option<String>,
    #[serde(rename = "Buyer_NIPT")]
    pub buyer_tax_id: Option<String>,
    #[serde(rename = "Article_Name")]
    pub article_name: String,
    #[serde(rename = "Category")]
    pub category: Option<String>,
    #[serde(rename = "Quantity")]
    pub quantity: f64,
    #[serde(rename = "Article_Price")]
    pub unit_price: f64,
    #[serde(rename = "Total_Article_Price")]
    pub total_price: f64,
    #[serde(rename = "Datetime", with = "occurred_at_format")]
    pub occurred_at: NaiveDateTime,
    #[serde(rename = "Seller Category")]
    pub seller_category: Option<String>,
}

/// Parses a combined timestamp as written by the canonical file or by storage.
pub fn parse_occurred_at(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

pub mod occurred_at_format {
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{parse_occurred_at, OCCURRED_AT_FORMAT};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(OCCURRED_AT_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_occurred_at(&raw).ok_or_else(|| de::Error::custom(format!("unparseable Datetime {raw:?}")))
    }
}

/// True when a cell carries the portal's aggregate-row label.
pub fn is_aggregate_label(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case(AGGREGATE_ROW_LABEL)
}

fn numeric_order_id(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Orders two external order identifiers.
///
/// Numeric when both sides parse as finite numbers, plain string order otherwise.
pub fn compare_order_ids(a: &str, b: &str) -> Ordering {
    match (numeric_order_id(a), numeric_order_id(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Greatest identifier under [`compare_order_ids`].
pub fn max_order_id<'a, I>(ids: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    ids.into_iter().max_by(|a, b| compare_order_ids(a, b))
}

/// The newest `(occurred_at, order_id)` pair already in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterMark {
    pub occurred_at: NaiveDateTime,
    pub order_id: Option<String>,
}

impl HighWaterMark {
    pub fn new(occurred_at: NaiveDateTime, order_id: Option<String>) -> Self {
        Self {
            occurred_at,
            order_id,
        }
    }

    /// Admission rule for a candidate row relative to this mark.
    pub fn admits(&self, occurred_at: NaiveDateTime, order_id: &str) -> bool {
        match occurred_at.cmp(&self.occurred_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match self.order_id.as_deref() {
                Some(mark) if !mark.trim().is_empty() => {
                    compare_order_ids(order_id, mark) == Ordering::Greater
                }
                _ => true,
            },
        }
    }
}

/// Applies the admission rule, treating a missing mark as empty storage.
pub fn is_admissible(mark: Option<&HighWaterMark>, record: &SalesRecord) -> bool {
    match mark {
        None => true,
        Some(mark) => mark.admits(record.occurred_at, &record.order_id),
    }
}
