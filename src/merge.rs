// 🔀 Cross-Source Merger - rebuild the unified store from per-source stores
//
// Every source declares a static mapping (unified column ← source field +
// coercion). The unified tables are dropped and recreated on each merge, so
// re-running with the same inputs reproduces the same rows.

use crate::coerce::{coerce_value, Coercion};
use crate::db::{
    open_read_only, open_store, quote_ident, relax_foreign_keys, table_columns, table_exists,
};
use crate::error::{PipelineError, Result};
use crate::sources::{Bank, ING_BALANCE_TIMESTAMPS};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// UNIFIED SCHEMA
// ============================================================================

const UNIFIED_SCHEMA: &str = "
    CREATE TABLE unified_accounts (
        account_id TEXT PRIMARY KEY,
        source_bank TEXT NOT NULL,
        iban TEXT,
        account_holder_name TEXT,
        currency TEXT DEFAULT 'EUR',
        product_name TEXT
    );

    CREATE TABLE unified_balances (
        balance_pk INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id_fk TEXT NOT NULL,
        source_bank TEXT NOT NULL,
        amount REAL,
        currency TEXT NOT NULL DEFAULT 'EUR',
        timestamp DATETIME,
        UNIQUE (account_id_fk, source_bank),
        FOREIGN KEY (account_id_fk) REFERENCES unified_accounts (account_id)
    );

    CREATE TABLE unified_transactions (
        transaction_pk INTEGER PRIMARY KEY AUTOINCREMENT,
        transaction_id TEXT,
        account_id_fk TEXT NOT NULL,
        source_bank TEXT NOT NULL,
        amount REAL,
        currency TEXT,
        booking_date DATETIME,
        execution_timestamp DATETIME,
        description TEXT,
        counterparty_name TEXT,
        counterparty_iban TEXT,
        type_code TEXT,
        UNIQUE (transaction_id, account_id_fk),
        FOREIGN KEY (account_id_fk) REFERENCES unified_accounts (account_id)
    );

    CREATE INDEX idx_unified_transactions_account ON unified_transactions(account_id_fk);
    CREATE INDEX idx_unified_transactions_booking ON unified_transactions(booking_date);
    CREATE INDEX idx_unified_transactions_source ON unified_transactions(source_bank);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnifiedTable {
    Accounts,
    Balances,
    Transactions,
}

impl UnifiedTable {
    pub fn all() -> [UnifiedTable; 3] {
        [UnifiedTable::Accounts, UnifiedTable::Balances, UnifiedTable::Transactions]
    }

    pub fn name(&self) -> &'static str {
        match self {
            UnifiedTable::Accounts => "unified_accounts",
            UnifiedTable::Balances => "unified_balances",
            UnifiedTable::Transactions => "unified_transactions",
        }
    }

    /// Column every row must carry; rows without it are skipped
    pub fn account_column(&self) -> &'static str {
        match self {
            UnifiedTable::Accounts => "account_id",
            _ => "account_id_fk",
        }
    }

    /// Autoincrement key, excluded from fingerprints
    fn surrogate_key(&self) -> Option<&'static str> {
        match self {
            UnifiedTable::Accounts => None,
            UnifiedTable::Balances => Some("balance_pk"),
            UnifiedTable::Transactions => Some("transaction_pk"),
        }
    }

    fn insert_sql(&self, columns: &[&str]) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let (names, placeholders) = (names.join(", "), placeholders.join(", "));

        match self {
            UnifiedTable::Accounts => format!(
                "INSERT OR REPLACE INTO unified_accounts ({}) VALUES ({})",
                names, placeholders
            ),
            // Latest timestamp wins; a NULL timestamp never replaces a known one
            UnifiedTable::Balances => format!(
                "INSERT INTO unified_balances ({}) VALUES ({})
                 ON CONFLICT (account_id_fk, source_bank) DO UPDATE SET
                     amount = excluded.amount,
                     currency = excluded.currency,
                     timestamp = excluded.timestamp
                 WHERE unified_balances.timestamp IS NULL
                    OR (excluded.timestamp IS NOT NULL AND excluded.timestamp >= unified_balances.timestamp)",
                names, placeholders
            ),
            UnifiedTable::Transactions => format!(
                "INSERT OR IGNORE INTO unified_transactions ({}) VALUES ({})",
                names, placeholders
            ),
        }
    }
}

/// Drop and recreate the unified tables
pub fn rebuild_unified_schema(conn: &Connection) -> Result<()> {
    relax_foreign_keys(conn)?;
    conn.execute_batch(
        "DROP TABLE IF EXISTS unified_transactions;
         DROP TABLE IF EXISTS unified_balances;
         DROP TABLE IF EXISTS unified_accounts;",
    )?;
    conn.execute_batch(UNIFIED_SCHEMA)?;

    info!("unified schema recreated");
    Ok(())
}

// ============================================================================
// FIELD MAPPING
// ============================================================================

/// Where a unified column reads its value from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Column(&'static str),
    /// First column holding a non-empty value
    FirstOf(&'static [&'static str]),
    Literal(&'static str),
    /// First non-empty column, else the literal
    FirstOrLiteral(&'static [&'static str], &'static str),
}

/// Row read from a per-source table, keyed by column name
pub type SourceRow = HashMap<String, SqlValue>;

fn present(value: &SqlValue) -> bool {
    match value {
        SqlValue::Null => false,
        SqlValue::Text(t) => !t.is_empty(),
        _ => true,
    }
}

/// Column value, matched ignoring ASCII case like SQLite does
fn lookup<'a>(row: &'a SourceRow, column: &str) -> Option<&'a SqlValue> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

fn first_present(row: &SourceRow, columns: &[&str]) -> Option<SqlValue> {
    columns
        .iter()
        .filter_map(|column| lookup(row, column))
        .find(|value| present(value))
        .cloned()
}

impl FieldSource {
    /// Columns absent from the source table read as NULL
    pub fn resolve(&self, row: &SourceRow) -> SqlValue {
        match self {
            FieldSource::Column(column) => lookup(row, column).cloned().unwrap_or(SqlValue::Null),
            FieldSource::FirstOf(columns) => first_present(row, columns).unwrap_or(SqlValue::Null),
            FieldSource::Literal(literal) => SqlValue::Text(literal.to_string()),
            FieldSource::FirstOrLiteral(columns, literal) => {
                first_present(row, columns).unwrap_or_else(|| SqlValue::Text(literal.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub unified: &'static str,
    pub source: FieldSource,
    pub coerce: Coercion,
}

const fn text(unified: &'static str, source: FieldSource) -> FieldMapping {
    FieldMapping { unified, source, coerce: Coercion::Text }
}

const fn numeric(unified: &'static str, source: FieldSource) -> FieldMapping {
    FieldMapping { unified, source, coerce: Coercion::Numeric }
}

const fn timestamp(unified: &'static str, source: FieldSource) -> FieldMapping {
    FieldMapping { unified, source, coerce: Coercion::Timestamp }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMapping {
    pub source_table: &'static str,
    pub target: UnifiedTable,
    pub fields: &'static [FieldMapping],
}

impl TableMapping {
    pub fn columns(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.unified).collect()
    }

    /// Resolve and coerce every mapped field of one row
    pub fn project(&self, row: &SourceRow) -> Vec<SqlValue> {
        self.fields
            .iter()
            .map(|field| coerce_value(field.source.resolve(row), field.coerce))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub bank: Bank,
    pub accounts: TableMapping,
    pub balances: TableMapping,
    pub transactions: TableMapping,
}

impl SourceMapping {
    pub fn for_table(&self, table: UnifiedTable) -> &TableMapping {
        match table {
            UnifiedTable::Accounts => &self.accounts,
            UnifiedTable::Balances => &self.balances,
            UnifiedTable::Transactions => &self.transactions,
        }
    }
}

use FieldSource::{Column, FirstOf, FirstOrLiteral, Literal};

pub const ING_MAPPING: SourceMapping = SourceMapping {
    bank: Bank::Ing,
    accounts: TableMapping {
        source_table: "accounts",
        target: UnifiedTable::Accounts,
        fields: &[
            text("account_id", Column("resourceId")),
            text("source_bank", Literal("ING")),
            // Card accounts have no IBAN; the masked card number stands in
            text("iban", FirstOf(&["iban", "maskedPan"])),
            text("account_holder_name", Column("name")),
            text("currency", FirstOrLiteral(&["currency"], "EUR")),
            text("product_name", Column("product")),
        ],
    },
    balances: TableMapping {
        source_table: "balances",
        target: UnifiedTable::Balances,
        fields: &[
            text("account_id_fk", Column("account_resourceId")),
            text("source_bank", Literal("ING")),
            numeric("amount", Column("amount")),
            text("currency", FirstOrLiteral(&["currency"], "EUR")),
            timestamp("timestamp", FirstOf(ING_BALANCE_TIMESTAMPS)),
        ],
    },
    transactions: TableMapping {
        source_table: "transactions",
        target: UnifiedTable::Transactions,
        fields: &[
            text("transaction_id", Column("transactionId")),
            text("account_id_fk", Column("account_resourceId")),
            text("source_bank", Literal("ING")),
            numeric("amount", Column("amount")),
            text("currency", FirstOrLiteral(&["currency"], "EUR")),
            timestamp("booking_date", FirstOf(&["bookingDate", "transactionDate"])),
            timestamp("execution_timestamp", Column("executionDateTime")),
            text(
                "description",
                FirstOf(&["remittanceInformationUnstructured", "transactionDetails"]),
            ),
            text("counterparty_name", FirstOf(&["creditorName", "debtorName"])),
            text(
                "counterparty_iban",
                FirstOf(&["creditorAccount_iban", "debtorAccount_iban"]),
            ),
            text("type_code", Column("transactionType")),
        ],
    },
};

pub const ABN_AMRO_MAPPING: SourceMapping = SourceMapping {
    bank: Bank::AbnAmro,
    accounts: TableMapping {
        source_table: "accounts",
        target: UnifiedTable::Accounts,
        fields: &[
            text("account_id", Column("accountNumber")),
            text("source_bank", Literal("ABN_AMRO")),
            text("iban", Column("accountNumber")),
            text("currency", FirstOrLiteral(&["currency"], "EUR")),
        ],
    },
    balances: TableMapping {
        source_table: "balances",
        target: UnifiedTable::Balances,
        fields: &[
            text("account_id_fk", Column("accountNumber")),
            text("source_bank", Literal("ABN_AMRO")),
            numeric("amount", Column("balance")),
            text("currency", FirstOrLiteral(&["currency"], "EUR")),
            timestamp("timestamp", Column("sourceTransactionTimestamp")),
        ],
    },
    transactions: TableMapping {
        source_table: "transactions",
        target: UnifiedTable::Transactions,
        fields: &[
            text("transaction_id", Column("transactionId")),
            text("account_id_fk", Column("account_iban")),
            text("source_bank", Literal("ABN_AMRO")),
            numeric("amount", Column("amount")),
            text("currency", FirstOrLiteral(&["currency"], "EUR")),
            timestamp("booking_date", Column("bookDate")),
            timestamp("execution_timestamp", Column("transactionTimestamp")),
            text("description", Column("description")),
            text("counterparty_name", Column("counterPartyName")),
            text("counterparty_iban", Column("counterPartyAccountNumber")),
            text("type_code", Column("mutationCode")),
        ],
    },
};

pub fn mapping_for(bank: Bank) -> &'static SourceMapping {
    match bank {
        Bank::Ing => &ING_MAPPING,
        Bank::AbnAmro => &ABN_AMRO_MAPPING,
    }
}

// ============================================================================
// MERGE
// ============================================================================

/// One opened per-source store
#[derive(Clone, Copy)]
pub struct MergeSource<'a> {
    pub bank: Bank,
    pub conn: &'a Connection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub sources_merged: Vec<Bank>,
    pub sources_missing: Vec<Bank>,
    pub accounts: usize,
    pub balances: usize,
    pub transactions_inserted: usize,
    pub transactions_ignored: usize,
    /// Ignored transactions whose existing row came from another bank
    pub cross_source_collisions: usize,
    pub rows_skipped: usize,
    pub fingerprint: String,
}

/// Read a per-source table in insertion order; an absent table yields no rows
pub fn read_source_rows(conn: &Connection, table: &str) -> Result<Vec<SourceRow>> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", quote_ident(table)))?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();

    let rows = stmt
        .query_map([], |row| {
            let mut values = SourceRow::with_capacity(names.len());
            for (index, name) in names.iter().enumerate() {
                values.insert(name.clone(), row.get::<_, SqlValue>(index)?);
            }
            Ok(values)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn existing_transaction_bank(conn: &Connection, values: &[SqlValue], columns: &[&str]) -> Result<Option<String>> {
    let position = |name: &str| columns.iter().position(|c| *c == name);
    let (Some(id), Some(account)) = (position("transaction_id"), position("account_id_fk")) else {
        return Ok(None);
    };

    let bank = conn
        .query_row(
            "SELECT source_bank FROM unified_transactions WHERE transaction_id = ?1 AND account_id_fk = ?2",
            [&values[id], &values[account]],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    Ok(bank)
}

/// Whether the store holds any table the bank's mapping reads
fn has_mapped_table(source: &MergeSource<'_>) -> Result<bool> {
    let mapping = mapping_for(source.bank);
    for table in UnifiedTable::all() {
        if table_exists(source.conn, mapping.for_table(table).source_table)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Merge one unified table from every source inside a single transaction
fn merge_table(
    unified: &Connection,
    sources: &[MergeSource<'_>],
    table: UnifiedTable,
    report: &mut MergeReport,
) -> Result<()> {
    let tx = unified.unchecked_transaction()?;

    for source in sources {
        let mapping = mapping_for(source.bank).for_table(table);

        if !table_exists(source.conn, mapping.source_table)? {
            warn!(
                bank = source.bank.name(),
                table = mapping.source_table,
                "source table absent, contributing zero rows"
            );
            continue;
        }

        let columns = mapping.columns();
        let account_index = columns.iter().position(|c| *c == table.account_column());
        let rows = read_source_rows(source.conn, mapping.source_table)?;
        let mut stmt = tx.prepare(&table.insert_sql(&columns))?;

        for row in &rows {
            let values = mapping.project(row);

            if account_index.map_or(true, |i| matches!(values[i], SqlValue::Null)) {
                warn!(bank = source.bank.name(), table = table.name(), "row without account id, skipping");
                report.rows_skipped += 1;
                continue;
            }

            let changed = stmt.execute(params_from_iter(values.iter()))?;

            match (table, changed) {
                (UnifiedTable::Transactions, 0) => {
                    report.transactions_ignored += 1;
                    match existing_transaction_bank(&tx, &values, &columns)? {
                        Some(bank) if bank != source.bank.code() => {
                            warn!(
                                bank = source.bank.name(),
                                existing = %bank,
                                transaction = ?values.first(),
                                "transaction id collides with another bank's row, keeping the first"
                            );
                            report.cross_source_collisions += 1;
                        }
                        _ => debug!(bank = source.bank.name(), "duplicate transaction ignored"),
                    }
                }
                (UnifiedTable::Transactions, _) => report.transactions_inserted += 1,
                _ => {}
            }
        }

        info!(
            bank = source.bank.name(),
            table = table.name(),
            rows = rows.len(),
            "source rows merged"
        );
    }

    tx.commit()?;
    Ok(())
}

/// Rebuild the unified store from already opened per-source stores.
///
/// A store without any mapped table counts as missing. If every store is
/// missing the merge fails with `NoSources` and the unified store is left as
/// it was. Phases (accounts, balances, transactions) each commit on their own.
pub fn merge_sources(unified: &Connection, sources: &[MergeSource<'_>]) -> Result<MergeReport> {
    let mut present = Vec::with_capacity(sources.len());
    let mut report = MergeReport::default();

    for source in sources {
        if has_mapped_table(source)? {
            present.push(*source);
            report.sources_merged.push(source.bank);
        } else {
            warn!(bank = source.bank.name(), "source store has no tables, skipping");
            report.sources_missing.push(source.bank);
        }
    }

    if present.is_empty() {
        let checked: Vec<&str> = sources.iter().map(|s| s.bank.name()).collect();
        return Err(PipelineError::NoSources(format!(
            "no source tables in stores of {}",
            checked.join(", ")
        )));
    }

    rebuild_unified_schema(unified)?;

    for table in UnifiedTable::all() {
        merge_table(unified, &present, table, &mut report)?;
    }

    // Replaced accounts and upserted balances: report what is stored
    report.accounts = count(unified, UnifiedTable::Accounts)?;
    report.balances = count(unified, UnifiedTable::Balances)?;
    report.fingerprint = fingerprint(unified)?;

    info!(
        accounts = report.accounts,
        balances = report.balances,
        transactions = report.transactions_inserted,
        ignored = report.transactions_ignored,
        "merge complete"
    );

    Ok(report)
}

fn count(conn: &Connection, table: UnifiedTable) -> Result<usize> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name()), [], |row| row.get(0))?;
    Ok(n as usize)
}

/// Merge per-source database files into the unified database file.
///
/// Missing source files are skipped with a warning; if none exist, or none
/// holds a table, the merge fails with `NoSources` before the unified store
/// is touched.
pub fn merge_files(unified_path: &Path, sources: &[(Bank, PathBuf)]) -> Result<MergeReport> {
    let (available, missing): (Vec<&(Bank, PathBuf)>, Vec<&(Bank, PathBuf)>) =
        sources.iter().partition(|(_, path)| path.exists());

    for (bank, path) in &missing {
        warn!(bank = bank.name(), path = %path.display(), "source database not found, skipping");
    }

    if available.is_empty() {
        let checked: Vec<String> = sources.iter().map(|(_, p)| p.display().to_string()).collect();
        return Err(PipelineError::NoSources(checked.join(", ")));
    }

    let connections = available
        .iter()
        .map(|(bank, path)| -> Result<(Bank, Connection)> { Ok((*bank, open_read_only(path)?)) })
        .collect::<Result<Vec<_>>>()?;

    let merge_sources_list: Vec<MergeSource<'_>> = connections
        .iter()
        .map(|(bank, conn)| MergeSource { bank: *bank, conn })
        .collect();

    let unified = open_store(unified_path)?;
    let mut report = merge_sources(&unified, &merge_sources_list)?;
    report.sources_missing.extend(missing.iter().map(|(bank, _)| *bank));

    Ok(report)
}

// ============================================================================
// FINGERPRINT
// ============================================================================

fn hash_value(hasher: &mut Sha256, value: &SqlValue) {
    match value {
        SqlValue::Null => hasher.update(b"N"),
        SqlValue::Integer(i) => hasher.update(format!("I{}", i).as_bytes()),
        SqlValue::Real(r) => hasher.update(format!("R{:?}", r).as_bytes()),
        SqlValue::Text(t) => {
            hasher.update(format!("T{}:", t.len()).as_bytes());
            hasher.update(t.as_bytes());
        }
        SqlValue::Blob(b) => {
            hasher.update(format!("B{}:", b.len()).as_bytes());
            hasher.update(b);
        }
    }
    hasher.update(b"|");
}

/// SHA-256 over every unified row, ignoring autoincrement keys.
///
/// Two merges of the same inputs produce the same fingerprint.
pub fn fingerprint(conn: &Connection) -> Result<String> {
    let mut hasher = Sha256::new();

    for table in UnifiedTable::all() {
        let columns: Vec<String> = table_columns(conn, table.name())?
            .into_iter()
            .filter(|c| Some(c.as_str()) != table.surrogate_key())
            .collect();

        if columns.is_empty() {
            continue;
        }

        let list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let list = list.join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY {}",
            list,
            table.name(),
            list
        ))?;

        hasher.update(table.name().as_bytes());
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for index in 0..columns.len() {
                hash_value(&mut hasher, &row.get::<_, SqlValue>(index)?);
            }
            hasher.update(b"\n");
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, SqlValue)]) -> SourceRow {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn ing_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE accounts (resourceId TEXT PRIMARY KEY, iban TEXT, maskedPan TEXT, name TEXT, currency TEXT, product TEXT);
             CREATE TABLE balances (account_resourceId TEXT PRIMARY KEY, amount TEXT, currency TEXT, lastChangeDateTime TEXT);
             CREATE TABLE transactions (transactionId TEXT NOT NULL, account_resourceId TEXT NOT NULL,
                 amount TEXT, bookingDate TEXT, remittanceInformationUnstructured TEXT, transactionDetails TEXT,
                 PRIMARY KEY (transactionId, account_resourceId));
             INSERT INTO accounts VALUES ('acc-1', 'NL69INGB0123456789', NULL, 'J. Doe', 'EUR', 'Current Account');
             INSERT INTO accounts VALUES ('card-1', NULL, '5678 **** **** 1234', 'J. Doe', NULL, 'Credit Card');
             INSERT INTO balances VALUES ('acc-1', '100.50', 'EUR', '2024-01-05T10:00:00Z');
             INSERT INTO transactions VALUES ('t-1', 'acc-1', '-5.00', '2024-01-04', 'Groceries', NULL);
             INSERT INTO transactions VALUES ('c-1', 'card-1', 'abc', '2024-01-04', NULL, 'COFFEE');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_field_source_resolution() {
        let r = row(&[
            ("iban", SqlValue::Text(String::new())),
            ("maskedPan", SqlValue::Text("5678 ****".into())),
        ]);

        assert_eq!(FirstOf(&["iban", "maskedPan"]).resolve(&r), SqlValue::Text("5678 ****".into()));
        assert_eq!(Column("missing").resolve(&r), SqlValue::Null);
        assert_eq!(FirstOrLiteral(&["currency"], "EUR").resolve(&r), SqlValue::Text("EUR".into()));
        assert_eq!(Literal("ING").resolve(&r), SqlValue::Text("ING".into()));
        // Stored spelling may differ in case from the mapping
        assert_eq!(Column("MASKEDPAN").resolve(&r), SqlValue::Text("5678 ****".into()));
    }

    #[test]
    fn test_mappings_cover_unified_columns() {
        for mapping in [&ING_MAPPING, &ABN_AMRO_MAPPING] {
            for table in UnifiedTable::all() {
                let columns = mapping.for_table(table).columns();
                assert!(columns.contains(&table.account_column()));
                assert!(columns.contains(&"source_bank"));
            }
        }
    }

    #[test]
    fn test_merge_coerces_and_reconciles_identifiers() {
        let ing = ing_store();
        let unified = Connection::open_in_memory().unwrap();

        let report = merge_sources(&unified, &[MergeSource { bank: Bank::Ing, conn: &ing }]).unwrap();

        assert_eq!(report.accounts, 2);
        assert_eq!(report.balances, 1);
        assert_eq!(report.transactions_inserted, 2);

        let card_iban: String = unified
            .query_row("SELECT iban FROM unified_accounts WHERE account_id = 'card-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(card_iban, "5678 **** **** 1234");

        let (amount, ts): (f64, String) = unified
            .query_row("SELECT amount, timestamp FROM unified_balances", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(amount, 100.5);
        assert_eq!(ts, "2024-01-05 10:00:00");

        // Non-numeric amount becomes NULL, the row is kept
        let (amount, description, booking): (Option<f64>, String, String) = unified
            .query_row(
                "SELECT amount, description, booking_date FROM unified_transactions WHERE transaction_id = 'c-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(amount, None);
        assert_eq!(description, "COFFEE");
        assert_eq!(booking, "2024-01-04 00:00:00");
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let ing = ing_store();
        let unified = Connection::open_in_memory().unwrap();
        let sources = [MergeSource { bank: Bank::Ing, conn: &ing }];

        let first = merge_sources(&unified, &sources).unwrap();
        let second = merge_sources(&unified, &sources).unwrap();

        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first, second);
        println!("✅ Rebuild determinism: fingerprint {}", &first.fingerprint[..12]);
    }

    #[test]
    fn test_empty_source_contributes_nothing() {
        let ing = ing_store();
        let empty = Connection::open_in_memory().unwrap();
        let unified = Connection::open_in_memory().unwrap();

        let report = merge_sources(
            &unified,
            &[
                MergeSource { bank: Bank::Ing, conn: &ing },
                MergeSource { bank: Bank::AbnAmro, conn: &empty },
            ],
        )
        .unwrap();

        assert_eq!(report.accounts, 2);
        let abn_rows: i64 = unified
            .query_row(
                "SELECT COUNT(*) FROM unified_accounts WHERE source_bank = 'ABN_AMRO'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(abn_rows, 0);
    }

    #[test]
    fn test_balance_upsert_keeps_latest() {
        let unified = Connection::open_in_memory().unwrap();
        rebuild_unified_schema(&unified).unwrap();
        let columns = ["account_id_fk", "source_bank", "amount", "timestamp"];
        let sql = UnifiedTable::Balances.insert_sql(&columns);

        for (amount, ts) in [(1.0, Some("2024-01-05 14:00:00")), (2.0, Some("2024-01-05 09:00:00")), (3.0, None)] {
            unified
                .execute(&sql, rusqlite::params!["acc", "ING", amount, ts])
                .unwrap();
        }

        let amount: f64 = unified
            .query_row("SELECT amount FROM unified_balances", [], |r| r.get(0))
            .unwrap();
        assert_eq!(amount, 1.0);
    }

    #[test]
    fn test_collision_across_banks_is_counted() {
        let ing = ing_store();
        let abn = Connection::open_in_memory().unwrap();
        // Same transaction id and account id as the ING row
        abn.execute_batch(
            "CREATE TABLE transactions (transactionId TEXT NOT NULL, account_iban TEXT NOT NULL, amount TEXT,
                 PRIMARY KEY (transactionId, account_iban));
             INSERT INTO transactions VALUES ('t-1', 'acc-1', '1');",
        )
        .unwrap();
        let unified = Connection::open_in_memory().unwrap();

        let report = merge_sources(
            &unified,
            &[
                MergeSource { bank: Bank::Ing, conn: &ing },
                MergeSource { bank: Bank::AbnAmro, conn: &abn },
            ],
        )
        .unwrap();

        assert_eq!(report.transactions_inserted, 2);
        assert_eq!(report.transactions_ignored, 1);
        assert_eq!(report.cross_source_collisions, 1);
    }

    #[test]
    fn test_transactions_without_accounts_table_merge() {
        let ing = Connection::open_in_memory().unwrap();
        ing.execute_batch(
            "CREATE TABLE transactions (transactionId TEXT NOT NULL, account_resourceId TEXT NOT NULL,
                 amount TEXT, PRIMARY KEY (transactionId, account_resourceId));
             INSERT INTO transactions VALUES ('t-1', 'acc-1', '-5.00');",
        )
        .unwrap();
        let unified = Connection::open_in_memory().unwrap();

        let report = merge_sources(&unified, &[MergeSource { bank: Bank::Ing, conn: &ing }]).unwrap();

        assert_eq!(report.accounts, 0);
        assert_eq!(report.transactions_inserted, 1);
        assert_eq!(report.sources_merged, vec![Bank::Ing]);
    }

    #[test]
    fn test_merge_files_with_only_empty_stores_fails() {
        let dir = std::env::temp_dir();
        let unified_path = dir.join(format!("unified-{}.db", uuid::Uuid::new_v4()));
        let ing_path = dir.join(format!("ing-{}.db", uuid::Uuid::new_v4()));
        let abn_path = dir.join(format!("abn-{}.db", uuid::Uuid::new_v4()));

        // A previous merge that must survive the failed one
        {
            let ing = ing_store();
            let unified = open_store(&unified_path).unwrap();
            merge_sources(&unified, &[MergeSource { bank: Bank::Ing, conn: &ing }]).unwrap();
        }
        for path in [&ing_path, &abn_path] {
            Connection::open(path).unwrap().pragma_update(None, "user_version", 1).unwrap();
        }

        let result = merge_files(
            &unified_path,
            &[(Bank::Ing, ing_path.clone()), (Bank::AbnAmro, abn_path.clone())],
        );

        assert!(matches!(result, Err(PipelineError::NoSources(_))));
        let accounts: i64 = Connection::open(&unified_path)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM unified_accounts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(accounts, 2);

        for path in [&unified_path, &ing_path, &abn_path] {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(path.with_extension("db-wal"));
            let _ = std::fs::remove_file(path.with_extension("db-shm"));
        }
    }

    #[test]
    fn test_merge_files_without_sources_fails() {
        let dir = std::env::temp_dir();
        let unified = dir.join(format!("unified-{}.db", uuid::Uuid::new_v4()));
        let sources = vec![(Bank::Ing, dir.join(format!("missing-{}.db", uuid::Uuid::new_v4())))];

        let result = merge_files(&unified, &sources);

        assert!(matches!(result, Err(PipelineError::NoSources(_))));
        assert!(!unified.exists());
    }
}
