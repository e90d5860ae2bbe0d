use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use psd2_aggregator::{
    describe_store, get_import_runs, merge_files, normalize_file, open_read_only, render_schema,
    run_all, run_read_only_query, Bank, ImportReport, ImportRun, MergeReport, PipelineConfig,
    QueryResult,
};

#[derive(Parser)]
#[command(name = "psd2-aggregator")]
#[command(about = "Normalize PSD2 bank documents and merge them into one queryable store")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    config: PipelineConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Normalize one bank's documents into its per-source store
    Normalize {
        #[arg(value_enum)]
        bank: Bank,

        /// Input document (defaults to the configured input for the bank)
        #[arg(long, short = 'i')]
        input: Option<PathBuf>,
    },

    /// Rebuild the unified store from the per-source stores
    Merge,

    /// Normalize every bank with an input file, then merge
    Run,

    /// Print the schema of a store (unified store by default)
    Schema {
        /// Store to inspect
        #[arg(long)]
        db: Option<PathBuf>,

        /// Also list import runs recorded in the store
        #[arg(long)]
        runs: bool,
    },

    /// Run a read-only SQL query against the unified store
    Query {
        sql: String,

        #[arg(long, short = 'f', value_enum, default_value = "table")]
        format: OutputFormat,

        /// Maximum rows to print
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.command {
        Command::Normalize { bank, input } => run_normalize(&config, bank, input),
        Command::Merge => run_merge(&config),
        Command::Run => run_pipeline(&config),
        Command::Schema { db, runs } => run_schema(&config, db, runs),
        Command::Query { sql, format, limit } => run_query(&config, &sql, format, limit),
    }
}

fn run_normalize(config: &PipelineConfig, bank: Bank, input: Option<PathBuf>) -> Result<()> {
    println!("🗄️  Normalize: {} documents → per-source store", bank.name());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let input = input
        .map(|path| config.resolve(&path))
        .unwrap_or_else(|| config.input_path(bank));
    let store = config.store_path(bank);

    let report = normalize_file(bank, &input, &store, &ImportRun::new())
        .with_context(|| format!("normalizing {}", input.display()))?;

    print_import(&report);
    println!("\n✅ Store written: {}", store.display());
    Ok(())
}

fn run_merge(config: &PipelineConfig) -> Result<()> {
    println!("🔀 Merge: per-source stores → unified store");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let unified = config.unified_path();
    let report = merge_files(&unified, &config.store_paths()).context("merging source stores")?;

    print_merge(&report);
    println!("\n✅ Unified store: {}", unified.display());
    Ok(())
}

fn run_pipeline(config: &PipelineConfig) -> Result<()> {
    println!("🚚 Pipeline: documents → per-source stores → unified store");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let summary = run_all(config).context("running pipeline")?;

    for report in &summary.imports {
        print_import(report);
    }
    print_merge(&summary.merge);

    println!("\n🎉 Pipeline complete: {}", config.unified_path().display());
    Ok(())
}

fn run_schema(config: &PipelineConfig, db: Option<PathBuf>, runs: bool) -> Result<()> {
    let path = db
        .map(|path| config.resolve(&path))
        .unwrap_or_else(|| config.unified_path());

    if !path.exists() {
        eprintln!("❌ Database not found: {}", path.display());
        eprintln!("   Run: psd2-aggregator run");
        std::process::exit(1);
    }

    let conn = open_read_only(&path)?;
    let tables = describe_store(&conn)?;

    println!("📐 Schema for {}\n", path.display());
    if tables.is_empty() {
        println!(" -> No tables found in this database.");
    } else {
        print!("{}", render_schema(&tables));
        for table in &tables {
            println!("✓ {}: {} rows", table.name, table.row_count);
        }
    }

    if runs && tables.iter().any(|t| t.name == "import_runs") {
        println!("\n📜 Import runs:");
        for run in get_import_runs(&conn)? {
            println!(
                "  {} {} {} (+{} tx, {} duplicates, {} skipped)",
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                run.bank.name(),
                run.run_id,
                run.transactions_inserted,
                run.transactions_ignored,
                run.records_skipped
            );
        }
    }

    Ok(())
}

fn run_query(config: &PipelineConfig, sql: &str, format: OutputFormat, limit: Option<usize>) -> Result<()> {
    let path = config.unified_path();
    let conn = open_read_only(&path).with_context(|| format!("opening {}", path.display()))?;

    let result = run_read_only_query(&conn, sql, limit)?;

    match format {
        OutputFormat::Table => print_table(&result),
        OutputFormat::Csv => write_csv(&result)?,
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
    }

    if result.truncated {
        eprintln!("⚠️  Output truncated to {} rows", result.rows.len());
    }

    Ok(())
}

// ============================================================================
// OUTPUT
// ============================================================================

fn print_import(report: &ImportReport) {
    println!("\n🏦 {} (run {})", report.bank.name(), report.run_id);
    println!("✓ Accounts written: {}", report.accounts_written);
    println!("✓ Balances written: {}", report.balances_written);
    println!("✓ Transactions inserted: {}", report.transactions_inserted);
    if report.transactions_ignored > 0 {
        println!("✓ Duplicates ignored: {}", report.transactions_ignored);
    }
    if report.records_skipped > 0 {
        println!("⚠️  Records skipped: {}", report.records_skipped);
    }
}

fn print_merge(report: &MergeReport) {
    let merged: Vec<&str> = report.sources_merged.iter().map(Bank::name).collect();
    println!("\n🔀 Merged sources: {}", merged.join(", "));
    if !report.sources_missing.is_empty() {
        let missing: Vec<&str> = report.sources_missing.iter().map(Bank::name).collect();
        println!("⚠️  Missing sources: {}", missing.join(", "));
    }
    println!("✓ Unified accounts: {}", report.accounts);
    println!("✓ Unified balances: {}", report.balances);
    println!("✓ Unified transactions: {}", report.transactions_inserted);
    if report.transactions_ignored > 0 {
        println!(
            "✓ Duplicates ignored: {} ({} across banks)",
            report.transactions_ignored, report.cross_source_collisions
        );
    }
    if report.rows_skipped > 0 {
        println!("⚠️  Rows skipped: {}", report.rows_skipped);
    }
    println!("🔏 Fingerprint: {}", report.fingerprint);
}

fn cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_table(result: &QueryResult) {
    let rows: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(cell).collect())
        .collect();

    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            rows.iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: &[String]| {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<width$}", v, width = *w))
            .collect::<Vec<_>>()
            .join(" │ ")
    };

    println!("{}", line(&result.columns));
    println!(
        "{}",
        widths.iter().map(|w| "─".repeat(*w)).collect::<Vec<_>>().join("─┼─")
    );
    for row in &rows {
        println!("{}", line(row));
    }
    println!("\n({} rows)", rows.len());
}

fn write_csv(result: &QueryResult) -> Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(&result.columns)?;
    for row in &result.rows {
        writer.write_record(row.iter().map(cell))?;
    }
    writer.flush()?;
    Ok(())
}
