// 🏦 Source Profiles - where each bank keeps its accounts, balances and transactions
// Polymorphic extraction for the supported PSD2 banks

use crate::db::{identifier_text, ImportRun};
use crate::discovery::{flatten, FlatRecord, FlattenRule};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Account identifier → raw per-account document, in file order
pub type AccountDocuments = Map<String, Value>;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Bank - which PSD2 API a document came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Bank {
    Ing,
    AbnAmro,
}

impl Bank {
    /// Human-readable name for display
    pub fn name(&self) -> &str {
        match self {
            Bank::Ing => "ING",
            Bank::AbnAmro => "ABN AMRO",
        }
    }

    /// Discriminator stored in `source_bank` columns
    pub fn code(&self) -> &'static str {
        match self {
            Bank::Ing => "ING",
            Bank::AbnAmro => "ABN_AMRO",
        }
    }

    pub fn from_code(code: &str) -> Option<Bank> {
        Bank::all().into_iter().find(|bank| bank.code() == code)
    }

    pub fn all() -> [Bank; 2] {
        [Bank::Ing, Bank::AbnAmro]
    }
}

/// One flattened record plus the account it belongs to.
///
/// For account records `account_id` is the account's own key.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub account_id: Option<String>,
    pub fields: FlatRecord,
}

/// Everything extracted from one source's documents
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub accounts: Vec<SourceRecord>,
    /// Explicit balance snapshots (may be empty when balances are derived)
    pub balances: Vec<SourceRecord>,
    pub transactions: Vec<SourceRecord>,
    /// Records dropped during extraction (unresolvable account)
    pub skipped: usize,
}

/// Per-source key and foreign-key column names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// Primary key of `accounts` (a field of every account record)
    pub account_key: &'static str,
    /// Account column of `balances` (primary key + foreign key)
    pub balance_account_column: &'static str,
    /// Account column of `transactions` (part of the composite key)
    pub transaction_account_column: &'static str,
    /// Transaction identifier field (part of the composite key)
    pub transaction_id: &'static str,
}

/// ING snapshot timestamp fields, in order of preference
pub const ING_BALANCE_TIMESTAMPS: &[&str] = &["lastChangeDateTime", "referenceDate"];

/// Where the current balance of an account comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceOrigin {
    /// Explicit snapshots; the latest by the first non-empty timestamp field is kept
    Snapshots { timestamp_fields: &'static [&'static str] },

    /// Derived from the transaction with the latest timestamp
    LatestTransaction {
        timestamp_field: &'static str,
        amount_field: &'static str,
    },
}

// ============================================================================
// BANK SOURCE TRAIT
// ============================================================================

/// BankSource - knowledge of one bank's document shape
///
/// Adding a bank means implementing this trait and a mapping in `merge`;
/// discovery, normalization and merging stay untouched.
pub trait BankSource: Send + Sync {
    fn bank(&self) -> Bank;

    fn layout(&self) -> TableLayout;

    fn balance_origin(&self) -> BalanceOrigin;

    /// Extract flattened records from every document of this source
    fn extract(&self, documents: &AccountDocuments, run: &ImportRun) -> SourceBatch;

    /// Extractor version (for provenance in logs)
    fn version(&self) -> &str {
        "1.0.0"
    }
}

/// Factory: extractor for a bank
pub fn get_source(bank: Bank) -> Box<dyn BankSource> {
    match bank {
        Bank::Ing => Box::new(IngSource),
        Bank::AbnAmro => Box::new(AbnAmroSource),
    }
}

/// Load the JSON document persisted between the fetch and normalize phases
pub fn load_documents(path: &Path) -> Result<AccountDocuments> {
    let text = std::fs::read_to_string(path)?;
    parse_documents(&text)
}

pub fn parse_documents(text: &str) -> Result<AccountDocuments> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(documents) => Ok(documents),
        other => Err(PipelineError::InvalidDocument(format!(
            "expected an object of per-account documents, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn objects<'a>(value: Option<&'a Value>) -> impl Iterator<Item = &'a Map<String, Value>> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(identifier_text)
}

// ============================================================================
// ING
// ============================================================================

const ING_ACCOUNT_RULES: &[FlattenRule] = &[FlattenRule::Drop("_links")];

const ING_BALANCE_RULES: &[FlattenRule] = &[FlattenRule::Merge("balanceAmount")];

const ING_TRANSACTION_RULES: &[FlattenRule] = &[
    FlattenRule::Merge("transactionAmount"),
    FlattenRule::Prefix("creditorAccount"),
    FlattenRule::Prefix("debtorAccount"),
    FlattenRule::Rename { from: "cardTransactionId", to: "transactionId" },
    FlattenRule::Drop("_links"),
];

/// Transaction container of an ING document, classified once
#[derive(Debug, Clone, Copy)]
enum TransactionContainer<'a> {
    Regular {
        account: Option<&'a Map<String, Value>>,
        by_status: &'a Map<String, Value>,
    },
    Card {
        card_account: Option<&'a Map<String, Value>>,
        by_status: &'a Map<String, Value>,
    },
}

impl<'a> TransactionContainer<'a> {
    fn parse(container: &'a Map<String, Value>) -> Option<Self> {
        if let Some(by_status) = container.get("cardTransactions").and_then(Value::as_object) {
            return Some(TransactionContainer::Card {
                card_account: container.get("cardAccount").and_then(Value::as_object),
                by_status,
            });
        }

        container
            .get("transactions")
            .and_then(Value::as_object)
            .map(|by_status| TransactionContainer::Regular {
                account: container.get("account").and_then(Value::as_object),
                by_status,
            })
    }

    fn by_status(&self) -> &'a Map<String, Value> {
        match self {
            TransactionContainer::Regular { by_status, .. }
            | TransactionContainer::Card { by_status, .. } => *by_status,
        }
    }

    /// Regular containers resolve by IBAN, card containers by masked PAN
    fn resolve(&self, index: &IngAccountIndex) -> Option<String> {
        match self {
            TransactionContainer::Regular { account, .. } => {
                account.and_then(|a| text_field(a, "iban")).and_then(|iban| index.by_iban(&iban))
            }
            TransactionContainer::Card { card_account, .. } => card_account
                .and_then(|a| text_field(a, "maskedPan"))
                .and_then(|pan| index.by_pan(&pan)),
        }
    }
}

/// IBAN / masked PAN → resourceId, built from every account of the run
#[derive(Debug, Default)]
struct IngAccountIndex {
    iban: HashMap<String, String>,
    pan: HashMap<String, String>,
}

impl IngAccountIndex {
    fn by_iban(&self, iban: &str) -> Option<String> {
        self.iban.get(iban).cloned()
    }

    fn by_pan(&self, pan: &str) -> Option<String> {
        self.pan.get(pan).cloned()
    }

    /// Balance containers reference the account by IBAN or by masked PAN
    fn resolve_reference(&self, reference: Option<&Map<String, Value>>) -> Option<String> {
        let reference = reference?;
        text_field(reference, "iban")
            .and_then(|iban| self.by_iban(&iban))
            .or_else(|| text_field(reference, "maskedPan").and_then(|pan| self.by_pan(&pan)))
    }
}

/// ING - Berlin Group style accounts / balances / transactions
pub struct IngSource;

impl BankSource for IngSource {
    fn bank(&self) -> Bank {
        Bank::Ing
    }

    fn layout(&self) -> TableLayout {
        TableLayout {
            account_key: "resourceId",
            balance_account_column: "account_resourceId",
            transaction_account_column: "account_resourceId",
            transaction_id: "transactionId",
        }
    }

    fn balance_origin(&self) -> BalanceOrigin {
        BalanceOrigin::Snapshots {
            timestamp_fields: ING_BALANCE_TIMESTAMPS,
        }
    }

    fn extract(&self, documents: &AccountDocuments, run: &ImportRun) -> SourceBatch {
        let mut batch = SourceBatch::default();
        let mut index = IngAccountIndex::default();
        let fetched_at = Value::String(run.timestamp());

        // Pass 1: accounts of every document, so later lookups see all of them
        for (key, document) in documents {
            let Some(document) = document.as_object() else {
                warn!(document = %key, "ING document is not an object, skipping");
                batch.skipped += 1;
                continue;
            };

            for account in objects(document.get("accounts")) {
                let mut fields = flatten(account, ING_ACCOUNT_RULES);
                fields.insert("fetch_timestamp".to_string(), fetched_at.clone());

                let resource_id = text_field(account, "resourceId");
                if let Some(id) = &resource_id {
                    if let Some(iban) = text_field(account, "iban") {
                        index.iban.insert(iban, id.clone());
                    }
                    if let Some(pan) = text_field(account, "maskedPan") {
                        index.pan.insert(pan, id.clone());
                    }
                }

                batch.accounts.push(SourceRecord {
                    account_id: resource_id,
                    fields,
                });
            }
        }

        // Pass 2: balances and transactions resolved through the index
        for (key, document) in documents {
            let Some(document) = document.as_object() else { continue };

            for container in objects(document.get("balances")) {
                let snapshots: Vec<&Map<String, Value>> = objects(container.get("balances")).collect();
                let account_id = index.resolve_reference(container.get("account").and_then(Value::as_object));

                if account_id.is_none() {
                    warn!(document = %key, count = snapshots.len(), "balance container references an unknown account, skipping");
                    batch.skipped += snapshots.len();
                    continue;
                }

                for balance in snapshots {
                    batch.balances.push(SourceRecord {
                        account_id: account_id.clone(),
                        fields: flatten(balance, ING_BALANCE_RULES),
                    });
                }
            }

            for container in objects(document.get("transactions")) {
                let Some(container) = TransactionContainer::parse(container) else {
                    debug!(document = %key, "transaction container without transactions, skipping");
                    continue;
                };

                let account_id = container.resolve(&index);

                for (status, list) in container.by_status() {
                    for tx in objects(Some(list)) {
                        if account_id.is_none() {
                            batch.skipped += 1;
                            continue;
                        }

                        let mut fields = flatten(tx, ING_TRANSACTION_RULES);
                        fields.insert("status".to_string(), Value::String(status.clone()));

                        batch.transactions.push(SourceRecord {
                            account_id: account_id.clone(),
                            fields,
                        });
                    }
                }

                if account_id.is_none() {
                    warn!(document = %key, ?container, "transaction container references an unknown account, skipped");
                }
            }
        }

        batch
    }
}

// ============================================================================
// ABN AMRO
// ============================================================================

const ABN_ACCOUNT_RULES: &[FlattenRule] = &[
    FlattenRule::Drop("account"),
    FlattenRule::Drop("transactions"),
];

const ABN_TRANSACTION_RULES: &[FlattenRule] = &[
    FlattenRule::JoinLines { from: "descriptionLines", to: "description" },
];

/// ABN AMRO - one account per document, balance carried by transactions
pub struct AbnAmroSource;

impl BankSource for AbnAmroSource {
    fn bank(&self) -> Bank {
        Bank::AbnAmro
    }

    fn layout(&self) -> TableLayout {
        TableLayout {
            account_key: "accountNumber",
            balance_account_column: "accountNumber",
            transaction_account_column: "account_iban",
            transaction_id: "transactionId",
        }
    }

    fn balance_origin(&self) -> BalanceOrigin {
        BalanceOrigin::LatestTransaction {
            timestamp_field: "transactionTimestamp",
            amount_field: "balanceAfterMutation",
        }
    }

    fn extract(&self, documents: &AccountDocuments, _run: &ImportRun) -> SourceBatch {
        let mut batch = SourceBatch::default();

        for (iban, document) in documents {
            let Some(document) = document.as_object() else {
                warn!(document = %iban, "ABN AMRO document is not an object, skipping");
                batch.skipped += 1;
                continue;
            };

            // Nested account number first, the document key as fallback
            let account_number = document
                .get("account")
                .and_then(Value::as_object)
                .and_then(|account| text_field(account, "accountNumber"))
                .or_else(|| Some(iban.clone()).filter(|k| !k.trim().is_empty()));

            let mut fields = flatten(document, ABN_ACCOUNT_RULES);
            if let Some(number) = &account_number {
                fields.insert("accountNumber".to_string(), Value::String(number.clone()));
            }

            batch.accounts.push(SourceRecord {
                account_id: account_number.clone(),
                fields,
            });

            for tx in objects(document.get("transactions")) {
                batch.transactions.push(SourceRecord {
                    account_id: account_number.clone(),
                    fields: flatten(tx, ABN_TRANSACTION_RULES),
                });
            }
        }

        batch
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn documents(value: Value) -> AccountDocuments {
        value.as_object().cloned().unwrap()
    }

    fn ing_documents() -> AccountDocuments {
        documents(json!({
            "NL69INGB0123456789": {
                "accounts": [
                    {"resourceId": "acc-1", "iban": "NL69INGB0123456789", "name": "J. Doe",
                     "currency": "EUR", "product": "Current Account", "_links": {"balances": {"href": "/b"}}},
                    {"resourceId": "card-1", "maskedPan": "5678 **** **** 1234", "name": "J. Doe",
                     "currency": "EUR", "product": "Credit Card"}
                ],
                "balances": [
                    {"account": {"iban": "NL69INGB0123456789"},
                     "balances": [{"balanceType": "expected", "lastChangeDateTime": "2024-01-05T10:00:00Z",
                                   "balanceAmount": {"amount": "100.00", "currency": "EUR"}}]}
                ],
                "transactions": [
                    {"account": {"iban": "NL69INGB0123456789"},
                     "transactions": {
                        "booked": [{"transactionId": "t-1", "bookingDate": "2024-01-04",
                                    "transactionAmount": {"amount": "-5.00", "currency": "EUR"},
                                    "creditorAccount": {"iban": "NL00SHOP"}}],
                        "pending": [{"transactionId": "t-2", "transactionAmount": {"amount": "-1.00", "currency": "EUR"}}]
                     }},
                    {"cardAccount": {"maskedPan": "5678 **** **** 1234"},
                     "cardTransactions": {"booked": [{"cardTransactionId": "c-1", "transactionDetails": "COFFEE",
                                                      "transactionAmount": {"amount": "-3.10", "currency": "EUR"}}]}},
                    {"account": {"iban": "NL00UNKNOWN"},
                     "transactions": {"booked": [{"transactionId": "t-x"}]}}
                ]
            }
        }))
    }

    #[test]
    fn test_bank_codes() {
        assert_eq!(Bank::Ing.code(), "ING");
        assert_eq!(Bank::AbnAmro.code(), "ABN_AMRO");
        assert_eq!(Bank::from_code("ABN_AMRO"), Some(Bank::AbnAmro));
        assert_eq!(Bank::from_code("RABO"), None);
        assert_eq!(Bank::AbnAmro.name(), "ABN AMRO");
    }

    #[test]
    fn test_get_source() {
        assert_eq!(get_source(Bank::Ing).bank(), Bank::Ing);
        assert_eq!(get_source(Bank::AbnAmro).bank(), Bank::AbnAmro);
    }

    #[test]
    fn test_parse_documents_requires_object() {
        assert!(parse_documents("{\"a\": {}}").is_ok());
        assert!(matches!(
            parse_documents("[1, 2]"),
            Err(PipelineError::InvalidDocument(_))
        ));
        assert!(matches!(
            parse_documents("{not json"),
            Err(PipelineError::Serialization(_))
        ));
    }

    #[test]
    fn test_ing_extracts_accounts_with_fetch_stamp() {
        let run = ImportRun::new();
        let batch = IngSource.extract(&ing_documents(), &run);

        assert_eq!(batch.accounts.len(), 2);
        let first = &batch.accounts[0];
        assert_eq!(first.account_id.as_deref(), Some("acc-1"));
        assert_eq!(first.fields.get("fetch_timestamp"), Some(&json!(run.timestamp())));
        assert!(!first.fields.contains_key("_links"));
    }

    #[test]
    fn test_ing_resolves_balances_and_card_transactions() {
        let batch = IngSource.extract(&ing_documents(), &ImportRun::new());

        assert_eq!(batch.balances.len(), 1);
        assert_eq!(batch.balances[0].account_id.as_deref(), Some("acc-1"));
        assert_eq!(batch.balances[0].fields.get("amount"), Some(&json!("100.00")));

        let ids: Vec<(&str, &str, &str)> = batch
            .transactions
            .iter()
            .map(|t| {
                (
                    t.account_id.as_deref().unwrap(),
                    t.fields["transactionId"].as_str().unwrap(),
                    t.fields["status"].as_str().unwrap(),
                )
            })
            .collect();

        assert_eq!(
            ids,
            vec![
                ("acc-1", "t-1", "booked"),
                ("acc-1", "t-2", "pending"),
                ("card-1", "c-1", "booked"),
            ]
        );
        assert_eq!(
            batch.transactions[0].fields.get("creditorAccount_iban"),
            Some(&json!("NL00SHOP"))
        );

        // The container with an unknown IBAN is dropped, not fatal
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn test_abn_extracts_account_number_and_description() {
        let docs = documents(json!({
            "NL12ABNA0000000001": {
                "account": {"accountNumber": "NL12ABNA0000000001", "balance": 5},
                "nextPageKey": "abc",
                "transactions": [
                    {"transactionId": "a-1", "descriptionLines": ["SEPA", "Bakker"], "amount": -2.5}
                ]
            },
            "NL99ABNA0000000009": {"transactions": []}
        }));

        let batch = AbnAmroSource.extract(&docs, &ImportRun::new());

        assert_eq!(batch.accounts.len(), 2);
        let account = &batch.accounts[0];
        assert_eq!(account.account_id.as_deref(), Some("NL12ABNA0000000001"));
        assert_eq!(account.fields.get("nextPageKey"), Some(&json!("abc")));
        assert!(!account.fields.contains_key("account"));
        assert!(!account.fields.contains_key("transactions"));

        // Key fallback when the nested account object is absent
        assert_eq!(batch.accounts[1].account_id.as_deref(), Some("NL99ABNA0000000009"));

        assert_eq!(batch.transactions.len(), 1);
        assert_eq!(
            batch.transactions[0].fields.get("description"),
            Some(&json!("SEPA\nBakker"))
        );
        assert!(batch.balances.is_empty());
    }
}
