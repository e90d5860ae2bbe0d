// 💾 Relational Normalizer - per-source tables from discovered column sets
//
// accounts      → INSERT OR REPLACE keyed by account id (latest fetch wins)
// balances      → INSERT OR REPLACE keyed by account id (latest timestamp wins)
// transactions  → INSERT OR IGNORE keyed by (transactionId, account) (first write wins)

use crate::coerce::parse_instant;
use crate::db::{
    identifier_text, json_to_sql, quote_ident, record_import_run, setup_source_store,
    table_columns, ImportReport, ImportRun,
};
use crate::discovery::{discover, field_value, ColumnSet, DiscoveredSchema, FlatRecord, RecordKind};
use crate::error::Result;
use crate::sources::{AccountDocuments, BalanceOrigin, BankSource, SourceBatch, SourceRecord, TableLayout};
use chrono::NaiveDateTime;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

// ============================================================================
// TABLE SPECS
// ============================================================================

/// Where a key column takes its value from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// A field of the flattened record
    Field(&'static str),
    /// The record's resolved account id, stored under this column
    AccountId(&'static str),
}

impl KeySource {
    pub fn column(&self) -> &'static str {
        match self {
            KeySource::Field(column) | KeySource::AccountId(column) => column,
        }
    }

    fn value(&self, record: &SourceRecord) -> Option<String> {
        match self {
            KeySource::Field(field) => field_value(&record.fields, field).and_then(identifier_text),
            KeySource::AccountId(_) => record.account_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPolicy {
    Replace,
    Ignore,
}

impl InsertPolicy {
    fn verb(&self) -> &'static str {
        match self {
            InsertPolicy::Replace => "INSERT OR REPLACE",
            InsertPolicy::Ignore => "INSERT OR IGNORE",
        }
    }
}

/// Key columns, insert policy and account reference of one per-source table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub kind: RecordKind,
    pub keys: Vec<KeySource>,
    pub policy: InsertPolicy,
    /// (local column, accounts key column)
    pub references: Option<(&'static str, &'static str)>,
}

impl TableSpec {
    pub fn for_kind(kind: RecordKind, layout: &TableLayout) -> Self {
        match kind {
            RecordKind::Account => TableSpec {
                kind,
                keys: vec![KeySource::Field(layout.account_key)],
                policy: InsertPolicy::Replace,
                references: None,
            },
            RecordKind::Balance => TableSpec {
                kind,
                keys: vec![KeySource::AccountId(layout.balance_account_column)],
                policy: InsertPolicy::Replace,
                references: Some((layout.balance_account_column, layout.account_key)),
            },
            RecordKind::Transaction => TableSpec {
                kind,
                keys: vec![
                    KeySource::Field(layout.transaction_id),
                    KeySource::AccountId(layout.transaction_account_column),
                ],
                policy: InsertPolicy::Ignore,
                references: Some((layout.transaction_account_column, layout.account_key)),
            },
        }
    }

    pub fn table(&self) -> &'static str {
        self.kind.table()
    }

    fn is_key(&self, column: &str) -> bool {
        self.keys.iter().any(|key| key.column().eq_ignore_ascii_case(column))
    }

    /// Non-key columns in ColumnSet order
    pub fn data_columns<'a>(&self, columns: &'a ColumnSet) -> Vec<&'a str> {
        columns.iter().filter(|c| !self.is_key(c)).collect()
    }

    /// Key columns first, then the data columns
    pub fn all_columns(&self, columns: &ColumnSet) -> Vec<String> {
        self.keys
            .iter()
            .map(|key| key.column().to_string())
            .chain(self.data_columns(columns).into_iter().map(String::from))
            .collect()
    }

    pub fn create_sql(&self, columns: &ColumnSet) -> String {
        let mut defs: Vec<String> = self
            .keys
            .iter()
            .map(|key| format!("{} TEXT NOT NULL", quote_ident(key.column())))
            .collect();

        defs.extend(
            self.data_columns(columns)
                .into_iter()
                .map(|column| format!("{} TEXT", quote_ident(column))),
        );

        let key_list: Vec<String> = self.keys.iter().map(|k| quote_ident(k.column())).collect();
        defs.push(format!("PRIMARY KEY ({})", key_list.join(", ")));

        if let Some((local, target)) = self.references {
            defs.push(format!(
                "FOREIGN KEY ({}) REFERENCES accounts ({})",
                quote_ident(local),
                quote_ident(target)
            ));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote_ident(self.table()),
            defs.join(",\n    ")
        )
    }

    fn insert_sql(&self, columns: &ColumnSet) -> String {
        let all = self.all_columns(columns);
        let names: Vec<String> = all.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=all.len()).map(|i| format!("?{}", i)).collect();

        format!(
            "{} INTO {} ({}) VALUES ({})",
            self.policy.verb(),
            quote_ident(self.table()),
            names.join(", "),
            placeholders.join(", ")
        )
    }
}

// ============================================================================
// TABLE SETUP
// ============================================================================

/// Create the table if absent, then append columns it does not have yet.
///
/// Existing rows and columns are never touched. Column names match ignoring
/// ASCII case.
pub fn ensure_table(conn: &Connection, spec: &TableSpec, columns: &ColumnSet) -> Result<usize> {
    conn.execute(&spec.create_sql(columns), [])?;

    let existing = table_columns(conn, spec.table())?;
    let mut added = 0;

    for column in spec.all_columns(columns) {
        if existing.iter().any(|c| c.eq_ignore_ascii_case(&column)) {
            continue;
        }

        conn.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT",
                quote_ident(spec.table()),
                quote_ident(&column)
            ),
            [],
        )?;
        info!(table = spec.table(), column = %column, "added column to existing table");
        added += 1;
    }

    Ok(added)
}

// ============================================================================
// RECORD WRITING
// ============================================================================

/// Counters of one write phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub written: usize,
    pub ignored: usize,
    pub skipped: usize,
}

/// Write one phase inside its own transaction.
///
/// Records missing a key are skipped; a key outside `columns` is fatal.
pub fn write_records(
    conn: &Connection,
    spec: &TableSpec,
    columns: &ColumnSet,
    records: &[SourceRecord],
) -> Result<PhaseOutcome> {
    let mut outcome = PhaseOutcome::default();
    let data_columns = spec.data_columns(columns);
    let tx = conn.unchecked_transaction()?;

    {
        let mut stmt = tx.prepare(&spec.insert_sql(columns))?;

        for record in records {
            columns.check_record(spec.table(), &record.fields)?;

            let keys: Option<Vec<String>> = spec.keys.iter().map(|key| key.value(record)).collect();
            let Some(keys) = keys else {
                warn!(
                    table = spec.table(),
                    keys = ?spec.keys.iter().map(KeySource::column).collect::<Vec<_>>(),
                    "record without its identifier, skipping"
                );
                outcome.skipped += 1;
                continue;
            };

            let values = keys.into_iter().map(SqlValue::Text).chain(
                data_columns
                    .iter()
                    .map(|column| field_value(&record.fields, column).map(json_to_sql).unwrap_or(SqlValue::Null)),
            );

            match stmt.execute(params_from_iter(values))? {
                0 => {
                    debug!(table = spec.table(), "duplicate record ignored");
                    outcome.ignored += 1;
                }
                _ => outcome.written += 1,
            }
        }
    }

    tx.commit()?;
    Ok(outcome)
}

// ============================================================================
// BALANCE SELECTION
// ============================================================================

/// Index of the latest record by timestamp.
///
/// Zoned timestamps are compared as UTC instants. Unparsable or missing timestamps rank lowest; ties go to the later record.
pub fn latest_by_timestamp<'a, I>(timestamps: I) -> Option<usize>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut best: Option<(usize, Option<NaiveDateTime>)> = None;

    for (index, raw) in timestamps.into_iter().enumerate() {
        let parsed = raw.and_then(parse_instant);
        match &best {
            Some((_, current)) if parsed < *current => {}
            _ => best = Some((index, parsed)),
        }
    }

    best.map(|(index, _)| index)
}

/// Group records per account, keeping first-seen account order
fn group_by_account(records: &[SourceRecord]) -> Vec<(String, Vec<&SourceRecord>)> {
    let mut groups: Vec<(String, Vec<&SourceRecord>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in records {
        let Some(account) = &record.account_id else { continue };
        match positions.get(account) {
            Some(&pos) => groups[pos].1.push(record),
            None => {
                positions.insert(account.clone(), groups.len());
                groups.push((account.clone(), vec![record]));
            }
        }
    }

    groups
}

fn field_text<'a>(fields: &'a FlatRecord, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(Value::as_str)
}

/// First field holding a non-empty string
fn first_text<'a>(fields: &'a FlatRecord, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| field_text(fields, name))
        .find(|text| !text.is_empty())
}

/// One current balance per account, per the source's balance origin
pub fn current_balances(origin: BalanceOrigin, batch: &SourceBatch, run: &ImportRun) -> Vec<SourceRecord> {
    match origin {
        BalanceOrigin::Snapshots { timestamp_fields } => group_by_account(&batch.balances)
            .into_iter()
            .filter_map(|(_, snapshots)| {
                let latest = latest_by_timestamp(
                    snapshots.iter().map(|s| first_text(&s.fields, timestamp_fields)),
                )?;
                Some(snapshots[latest].clone())
            })
            .collect(),

        BalanceOrigin::LatestTransaction {
            timestamp_field,
            amount_field,
        } => group_by_account(&batch.transactions)
            .into_iter()
            .filter_map(|(account, transactions)| {
                let latest = latest_by_timestamp(
                    transactions.iter().map(|t| field_text(&t.fields, timestamp_field)),
                )?;
                let source = &transactions[latest].fields;

                let amount = source.get(amount_field).filter(|v| !v.is_null())?;

                let mut fields = FlatRecord::new();
                fields.insert("balance".to_string(), amount.clone());
                fields.insert(
                    "sourceTransactionTimestamp".to_string(),
                    source.get(timestamp_field).cloned().unwrap_or(Value::Null),
                );
                fields.insert("lastUpdatedTimestamp".to_string(), Value::String(run.timestamp()));

                Some(SourceRecord {
                    account_id: Some(account),
                    fields,
                })
            })
            .collect(),
    }
}

// ============================================================================
// NORMALIZATION RUN
// ============================================================================

/// Discover, create and populate the per-source tables for one document set.
///
/// Each phase commits on its own, so a failure in the transactions phase
/// leaves accounts and balances durable.
pub fn normalize_documents(
    conn: &Connection,
    source: &dyn BankSource,
    documents: &AccountDocuments,
    run: &ImportRun,
) -> Result<ImportReport> {
    let bank = source.bank();
    let layout = source.layout();
    info!(bank = bank.name(), documents = documents.len(), version = source.version(), "normalizing source documents");

    setup_source_store(conn)?;

    let batch = source.extract(documents, run);
    let balances = current_balances(source.balance_origin(), &batch, run);

    let phases: [(RecordKind, &[SourceRecord]); 3] = [
        (RecordKind::Account, &batch.accounts),
        (RecordKind::Balance, &balances),
        (RecordKind::Transaction, &batch.transactions),
    ];

    // Discovery runs over exactly the records that get written
    let mut schema = DiscoveredSchema::default();
    for (kind, records) in &phases {
        *schema.for_kind_mut(*kind) = discover(records.iter().map(|r| &r.fields));
        info!(
            bank = bank.name(),
            table = kind.table(),
            records = records.len(),
            columns = schema.for_kind(*kind).len(),
            "discovered columns"
        );
    }

    let mut report = ImportReport::new(run, bank);
    report.records_skipped = batch.skipped;

    for (kind, records) in &phases {
        let spec = TableSpec::for_kind(*kind, &layout);
        let columns = schema.for_kind(*kind);

        ensure_table(conn, &spec, columns)?;
        let outcome = write_records(conn, &spec, columns, records)?;

        match kind {
            RecordKind::Account => report.accounts_written = outcome.written,
            RecordKind::Balance => report.balances_written = outcome.written,
            RecordKind::Transaction => {
                report.transactions_inserted = outcome.written;
                report.transactions_ignored = outcome.ignored;
            }
        }
        report.records_skipped += outcome.skipped;

        info!(
            bank = bank.name(),
            table = kind.table(),
            written = outcome.written,
            ignored = outcome.ignored,
            skipped = outcome.skipped,
            "phase committed"
        );
    }

    record_import_run(conn, &report)?;
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================
