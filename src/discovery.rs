// 🧭 Schema Discovery - flatten nested bank payloads into a unioned column set
//
// Bank APIs nest amounts, counterparty accounts and description lines in
// different ways. Each source declares how its records are flattened
// (FlattenRule) and discovery accumulates every resulting key into a
// ColumnSet per record kind. The same flattened records are later written
// by the normalizer, so discovery and insertion can never disagree.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Single-level record: every value is a scalar or compact JSON text
pub type FlatRecord = BTreeMap<String, Value>;

// ============================================================================
// RECORD KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Account,
    Balance,
    Transaction,
}

impl RecordKind {
    /// Per-source table holding this kind of record
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Account => "accounts",
            RecordKind::Balance => "balances",
            RecordKind::Transaction => "transactions",
        }
    }
}

// ============================================================================
// FLATTEN RULES
// ============================================================================

/// How one named field of a raw record is folded into the parent key space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenRule {
    /// `{"transactionAmount": {"amount": 1}}` → `{"amount": 1}`
    Merge(&'static str),

    /// `{"creditorAccount": {"iban": "NL.."}}` → `{"creditorAccount_iban": "NL.."}`
    Prefix(&'static str),

    /// Alias of a canonical field (`cardTransactionId` → `transactionId`)
    Rename { from: &'static str, to: &'static str },

    /// Array of text lines joined with `\n` under a new name
    JoinLines { from: &'static str, to: &'static str },

    /// Field is not stored at all
    Drop(&'static str),
}

impl FlattenRule {
    fn field(&self) -> &'static str {
        match self {
            FlattenRule::Merge(f) | FlattenRule::Prefix(f) | FlattenRule::Drop(f) => f,
            FlattenRule::Rename { from, .. } | FlattenRule::JoinLines { from, .. } => from,
        }
    }
}

/// Scalars pass through; nested objects and arrays become compact JSON text.
fn scalarize(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        scalar => scalar.clone(),
    }
}

fn join_lines(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let lines: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Value::String(lines.join("\n"))
        }
        other => scalarize(other),
    }
}

/// Flatten one raw record.
///
/// Plain fields are written first, then merged/prefixed nested objects,
/// then aliases. Later steps overwrite earlier ones, so a nested
/// `amount` wins over a top-level `amount` and a renamed alias wins over
/// a canonical field of the same name. The function is pure and total.
pub fn flatten(record: &Map<String, Value>, rules: &[FlattenRule]) -> FlatRecord {
    let mut flat = FlatRecord::new();
    let mut nested: Vec<(&FlattenRule, &Value)> = Vec::new();
    let mut aliases: Vec<(&FlattenRule, &Value)> = Vec::new();

    for (key, value) in record {
        match rules.iter().find(|rule| rule.field() == key.as_str()) {
            None => {
                flat.insert(key.clone(), scalarize(value));
            }
            Some(FlattenRule::Drop(_)) => {}
            Some(rule @ (FlattenRule::Merge(_) | FlattenRule::Prefix(_))) => {
                if value.is_object() {
                    nested.push((rule, value));
                } else {
                    flat.insert(key.clone(), scalarize(value));
                }
            }
            Some(rule) => aliases.push((rule, value)),
        }
    }

    for (rule, value) in nested {
        let Some(inner) = value.as_object() else { continue };
        for (key, inner_value) in inner {
            let name = match rule {
                FlattenRule::Prefix(prefix) => format!("{}_{}", prefix, key),
                _ => key.clone(),
            };
            flat.insert(name, scalarize(inner_value));
        }
    }

    for (rule, value) in aliases {
        match rule {
            FlattenRule::Rename { to, .. } => {
                flat.insert(to.to_string(), scalarize(value));
            }
            FlattenRule::JoinLines { to, .. } => {
                flat.insert(to.to_string(), join_lines(value));
            }
            _ => {}
        }
    }

    flat
}

// ============================================================================
// COLUMN SET
// ============================================================================

/// Sorted, deduplicated column names of one record kind within one source.
///
/// A ColumnSet only grows: absorbing more records never removes a column.
/// Names are unique ignoring ASCII case, as SQLite column names are; the
/// first spelling absorbed is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSet {
    columns: BTreeSet<String>,
}

impl ColumnSet {
    pub fn new() -> Self {
        ColumnSet::default()
    }

    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = ColumnSet::new();
        for column in columns {
            set.insert(column);
        }
        set
    }

    pub fn insert(&mut self, column: impl Into<String>) {
        let column = column.into();
        if self.canonical(&column).is_none() {
            self.columns.insert(column);
        }
    }

    /// Add every key of a flattened record
    pub fn absorb(&mut self, record: &FlatRecord) {
        for key in record.keys() {
            if self.canonical(key).is_none() {
                self.columns.insert(key.clone());
            }
        }
    }

    /// Union with another set (used when discovery runs over several batches)
    pub fn extend(&mut self, other: &ColumnSet) {
        for column in other.iter() {
            self.insert(column);
        }
    }

    /// Stored spelling of `column`, matched ignoring ASCII case
    pub fn canonical(&self, column: &str) -> Option<&str> {
        match self.columns.get(column) {
            Some(exact) => Some(exact.as_str()),
            None => self.iter().find(|c| c.eq_ignore_ascii_case(column)),
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.canonical(column).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Columns in deterministic (sorted) order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn is_subset(&self, other: &ColumnSet) -> bool {
        self.iter().all(|column| other.contains(column))
    }

    /// Fail with `SchemaDrift` if the record has a key outside this set
    pub fn check_record(&self, table: &str, record: &FlatRecord) -> Result<()> {
        match record.keys().find(|key| !self.contains(key)) {
            Some(column) => Err(PipelineError::SchemaDrift {
                table: table.to_string(),
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Value of `column` in a record, preferring the exact spelling over a key
/// that differs only in ASCII case
pub fn field_value<'a>(record: &'a FlatRecord, column: &str) -> Option<&'a Value> {
    record.get(column).or_else(|| {
        record
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

/// Discover the ColumnSet of a batch of flattened records
pub fn discover<'a, I>(records: I) -> ColumnSet
where
    I: IntoIterator<Item = &'a FlatRecord>,
{
    let mut columns = ColumnSet::new();
    discover_into(&mut columns, records);
    columns
}

/// Accumulate more records into an existing ColumnSet
pub fn discover_into<'a, I>(columns: &mut ColumnSet, records: I)
where
    I: IntoIterator<Item = &'a FlatRecord>,
{
    for record in records {
        columns.absorb(record);
    }
}

// ============================================================================
// DISCOVERED SCHEMA (all kinds of one source)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredSchema {
    pub accounts: ColumnSet,
    pub balances: ColumnSet,
    pub transactions: ColumnSet,
}

impl DiscoveredSchema {
    pub fn for_kind(&self, kind: RecordKind) -> &ColumnSet {
        match kind {
            RecordKind::Account => &self.accounts,
            RecordKind::Balance => &self.balances,
            RecordKind::Transaction => &self.transactions,
        }
    }

    pub fn for_kind_mut(&mut self, kind: RecordKind) -> &mut ColumnSet {
        match kind {
            RecordKind::Account => &mut self.accounts,
            RecordKind::Balance => &mut self.balances,
            RecordKind::Transaction => &mut self.transactions,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TX_RULES: &[FlattenRule] = &[
        FlattenRule::Merge("transactionAmount"),
        FlattenRule::Prefix("creditorAccount"),
        FlattenRule::Prefix("debtorAccount"),
        FlattenRule::Rename { from: "cardTransactionId", to: "transactionId" },
        FlattenRule::JoinLines { from: "descriptionLines", to: "description" },
        FlattenRule::Drop("_links"),
    ];

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_flatten_merges_amount_object() {
        let raw = object(json!({
            "transactionId": "t1",
            "transactionAmount": {"amount": "10.00", "currency": "EUR"}
        }));

        let flat = flatten(&raw, TX_RULES);

        assert_eq!(flat.get("amount"), Some(&json!("10.00")));
        assert_eq!(flat.get("currency"), Some(&json!("EUR")));
        assert!(!flat.contains_key("transactionAmount"));
    }

    #[test]
    fn test_flatten_prefixes_role_objects() {
        let raw = object(json!({
            "creditorAccount": {"iban": "NL01"},
            "debtorAccount": {"iban": "NL02"}
        }));

        let flat = flatten(&raw, TX_RULES);

        assert_eq!(flat.get("creditorAccount_iban"), Some(&json!("NL01")));
        assert_eq!(flat.get("debtorAccount_iban"), Some(&json!("NL02")));
        assert!(!flat.contains_key("iban"));
    }

    #[test]
    fn test_flatten_renames_card_alias() {
        let raw = object(json!({"cardTransactionId": "c-9", "transactionDetails": "COFFEE"}));

        let flat = flatten(&raw, TX_RULES);

        assert_eq!(flat.get("transactionId"), Some(&json!("c-9")));
        assert!(!flat.contains_key("cardTransactionId"));
    }

    #[test]
    fn test_flatten_joins_description_lines_and_drops_links() {
        let raw = object(json!({
            "descriptionLines": ["SEPA Overboeking", "Naam: Bakker"],
            "_links": {"self": {"href": "/x"}}
        }));

        let flat = flatten(&raw, TX_RULES);

        assert_eq!(
            flat.get("description"),
            Some(&json!("SEPA Overboeking\nNaam: Bakker"))
        );
        assert!(!flat.contains_key("_links"));
        assert!(!flat.contains_key("descriptionLines"));
    }

    #[test]
    fn test_flatten_is_total_over_unknown_nesting() {
        let raw = object(json!({
            "remittance": {"structured": {"ref": 1}},
            "tags": [1, 2],
            "transactionAmount": "not-an-object",
            "flag": true,
            "none": null
        }));

        let flat = flatten(&raw, TX_RULES);

        assert_eq!(flat.get("remittance"), Some(&json!("{\"structured\":{\"ref\":1}}")));
        assert_eq!(flat.get("tags"), Some(&json!("[1,2]")));
        assert_eq!(flat.get("transactionAmount"), Some(&json!("not-an-object")));
        assert_eq!(flat.get("flag"), Some(&json!(true)));
        assert_eq!(flat.get("none"), Some(&Value::Null));
    }

    #[test]
    fn test_card_and_regular_transactions_share_one_column() {
        let regular = flatten(&object(json!({"transactionId": "r1", "bookingDate": "2024-01-01"})), TX_RULES);
        let card = flatten(&object(json!({"cardTransactionId": "c1", "transactionDate": "2024-01-02"})), TX_RULES);

        let columns = discover([&regular, &card]);

        let names: Vec<&str> = columns.iter().collect();
        assert_eq!(names, vec!["bookingDate", "transactionDate", "transactionId"]);
    }

    #[test]
    fn test_discovery_is_monotonic() {
        let b1 = vec![
            flatten(&object(json!({"transactionId": "1", "amount": 1})), TX_RULES),
        ];
        let mut b2 = b1.clone();
        b2.push(flatten(
            &object(json!({"transactionId": "2", "creditorAccount": {"iban": "NL"}})),
            TX_RULES,
        ));

        let c1 = discover(&b1);
        let c2 = discover(&b2);
        assert!(c1.is_subset(&c2));

        // Absorbing further batches never removes a column
        let mut running = c2.clone();
        discover_into(&mut running, &b1);
        assert_eq!(running, c2);

        println!("✅ Monotonic discovery: {} ⊆ {} columns", c1.len(), c2.len());
    }

    #[test]
    fn test_column_set_is_sorted_and_deduplicated() {
        let columns = ColumnSet::from_columns(["b", "a", "b", "c"]);
        let names: Vec<&str> = columns.iter().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(columns.len(), 3);
    }

    #[test]
    fn test_column_names_fold_ascii_case() {
        let mut record = FlatRecord::new();
        record.insert("amount".into(), json!(1));
        record.insert("Amount".into(), json!("1.00"));
        record.insert("transactionId".into(), json!("T1"));

        let columns = discover([&record]);

        assert_eq!(columns.len(), 2);
        assert!(columns.contains("AMOUNT"));
        assert_eq!(columns.canonical("TRANSACTIONID"), Some("transactionId"));
        assert!(columns.check_record("transactions", &record).is_ok());
        assert_eq!(field_value(&record, "amount"), Some(&json!(1)));
        assert_eq!(field_value(&record, "TransactionID"), Some(&json!("T1")));
    }

    #[test]
    fn test_check_record_reports_drift() {
        let columns = ColumnSet::from_columns(["transactionId", "amount"]);
        let mut record = FlatRecord::new();
        record.insert("transactionId".into(), json!("1"));
        assert!(columns.check_record("transactions", &record).is_ok());

        record.insert("surprise".into(), json!("x"));
        match columns.check_record("transactions", &record) {
            Err(PipelineError::SchemaDrift { table, column }) => {
                assert_eq!(table, "transactions");
                assert_eq!(column, "surprise");
            }
            other => panic!("expected schema drift, got {:?}", other),
        }
    }
}
