use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand};
use multistore_inventory::{
    config::{self, AppConfig},
    db,
    events::process_events,
    services::{AllocationOptions, AllocationResult, AllocationStrategy},
    InventoryEngine,
};
use serde::Serialize;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(config.log_level(), config.log_json);

    let (engine, events) = InventoryEngine::connect(&config)
        .await
        .context("failed to start inventory engine")?;
    tokio::spawn(process_events(events));

    match cli.command {
        Commands::Migrate => handle_migrate(&config, cli.json).await,
        Commands::Simulate(args) => handle_simulate(&engine, args, cli.json).await,
        Commands::Report(args) => handle_report(&engine, args, cli.json).await,
        Commands::Recalculate(args) => handle_recalculate(&engine, args, cli.json).await,
        Commands::LowStock(args) => handle_low_stock(&engine, args, cli.json).await,
        Commands::TransferOptions(args) => handle_transfer_options(&engine, args, cli.json).await,
        Commands::TimeSeries(args) => handle_time_series(&engine, args, cli.json).await,
        Commands::Orphans => handle_orphans(&engine, cli.json).await,
    }
}

#[derive(Parser)]
#[command(
    name = "inventory-cli",
    about = "Operate the multi-store inventory allocation engine",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Preview how a quantity of new stock would be allocated
    Simulate(SimulateArgs),
    /// Backlog statistics for a variant
    Report(VariantArgs),
    /// Recompute stored priority scores of open backorders
    Recalculate(RecalculateArgs),
    /// Rows at or below their low-stock threshold, and exhausted rows
    LowStock(StoreArgs),
    /// Rank other stores able to cover a shortage
    TransferOptions(TransferOptionsArgs),
    /// Daily quantity of a variant rebuilt from the ledger
    TimeSeries(TimeSeriesArgs),
    /// Inventory rows whose variant was removed from the catalogue
    Orphans,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(long, help = "Product variant id")]
    variant: i64,
    #[arg(long, help = "Hypothetical units received")]
    quantity: i32,
    #[arg(long, help = "fifo, customer_priority, deadline_priority or smart_priority")]
    strategy: Option<AllocationStrategy>,
    #[arg(long, help = "Only consider backorders of this store")]
    store: Option<i64>,
}

#[derive(Args)]
struct VariantArgs {
    #[arg(long, help = "Product variant id")]
    variant: i64,
}

#[derive(Args)]
struct RecalculateArgs {
    #[arg(long, help = "Limit to one product variant")]
    variant: Option<i64>,
}

#[derive(Args)]
struct StoreArgs {
    #[arg(long, help = "Limit to one store")]
    store: Option<i64>,
}

#[derive(Args)]
struct TransferOptionsArgs {
    #[arg(long, help = "Product variant id")]
    variant: i64,
    #[arg(long, help = "Store that is short of stock")]
    store: i64,
    #[arg(long, help = "Units missing at the target store")]
    shortage: i32,
}

#[derive(Args)]
struct TimeSeriesArgs {
    #[arg(long, help = "Product variant id")]
    variant: i64,
    #[arg(long, help = "First day (YYYY-MM-DD)")]
    from: NaiveDate,
    #[arg(long, help = "Last day (YYYY-MM-DD), inclusive")]
    to: NaiveDate,
    #[arg(long, help = "Limit to one store; all stores are summed otherwise")]
    store: Option<i64>,
}

async fn handle_migrate(config: &AppConfig, json: bool) -> Result<()> {
    let pool = db::establish_connection_from_app_config(config)
        .await
        .context("failed to connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    db::close_pool(pool).await?;

    if json {
        print_json(&serde_json::json!({ "migrated": true }))?;
    } else {
        println!("Migrations applied");
    }
    Ok(())
}

async fn handle_simulate(engine: &InventoryEngine, args: SimulateArgs, json: bool) -> Result<()> {
    let result = engine
        .allocation
        .simulate_allocation(
            args.variant,
            args.quantity,
            AllocationOptions {
                strategy: args.strategy,
                store_id: args.store,
            },
        )
        .await
        .context("simulation failed")?;

    if json {
        print_json(&result)?;
    } else {
        render_allocation(&result);
    }
    Ok(())
}

async fn handle_report(engine: &InventoryEngine, args: VariantArgs, json: bool) -> Result<()> {
    let report = engine
        .allocation
        .get_allocation_report(args.variant)
        .await
        .context("failed to build allocation report")?;

    if json {
        print_json(&report)?;
        return Ok(());
    }

    println!(
        "Variant {} • {} waiting lines • {} units pending • {} unassigned received units",
        report.product_variant_id,
        report.pending_lines,
        report.pending_quantity,
        report.unassigned_purchase_quantity
    );
    for (tier, bucket) in &report.by_customer_tier {
        println!("  tier {:<8} {} lines, {} units", tier, bucket.lines, bucket.quantity);
    }
    for (priority, bucket) in &report.by_order_priority {
        println!(
            "  priority {:<8} {} lines, {} units",
            priority, bucket.lines, bucket.quantity
        );
    }
    if let Some(hours) = report.oldest_waiting_hours {
        println!("  oldest line waiting {}h", hours);
    }
    println!("  past deadline: {}", report.lines_past_deadline);
    if !report.next_in_line.is_empty() {
        println!("  next in line: {:?}", report.next_in_line);
    }
    Ok(())
}

async fn handle_recalculate(
    engine: &InventoryEngine,
    args: RecalculateArgs,
    json: bool,
) -> Result<()> {
    let summary = engine
        .allocation
        .recalculate_priority_scores(args.variant)
        .await
        .context("failed to recalculate priority scores")?;

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "Updated {} scores ({} manual overrides left untouched)",
            summary.updated, summary.skipped_overridden
        );
    }
    Ok(())
}

async fn handle_low_stock(engine: &InventoryEngine, args: StoreArgs, json: bool) -> Result<()> {
    let report = engine
        .inventory
        .low_stock_report(args.store)
        .await
        .context("failed to build low stock report")?;

    if json {
        print_json(&report)?;
        return Ok(());
    }

    println!("Low stock ({}):", report.low_stock.len());
    for row in &report.low_stock {
        println!(
            "- variant {:?} @ store {} • {} left (threshold {})",
            row.product_variant_id, row.store_id, row.quantity, row.low_stock_threshold
        );
    }
    println!("Out of stock ({}):", report.out_of_stock.len());
    for row in &report.out_of_stock {
        println!("- variant {:?} @ store {}", row.product_variant_id, row.store_id);
    }
    Ok(())
}

async fn handle_transfer_options(
    engine: &InventoryEngine,
    args: TransferOptionsArgs,
    json: bool,
) -> Result<()> {
    let suggestion = engine
        .transfers
        .get_transfer_options_for_stock_suggestion(args.variant, args.store, args.shortage)
        .await
        .context("failed to rank transfer sources")?;

    if json {
        print_json(&suggestion)?;
        return Ok(());
    }

    println!(
        "Shortage of {} at store {}: {} coverable{}",
        suggestion.shortage,
        suggestion.target_store_id,
        suggestion.coverable_quantity,
        if suggestion.fully_coverable { "" } else { " (partial)" }
    );
    for option in &suggestion.options {
        let distance = option
            .distance_km
            .map(|d| format!("{:.1} km", d))
            .unwrap_or_else(|| "unknown distance".to_string());
        println!(
            "- {} (store {}) • {} available • take {} • {}",
            option.store_name, option.store_id, option.available_qty, option.suggested_qty, distance
        );
    }
    Ok(())
}

async fn handle_time_series(
    engine: &InventoryEngine,
    args: TimeSeriesArgs,
    json: bool,
) -> Result<()> {
    let series = engine
        .inventory
        .get_inventory_time_series(args.variant, args.from, args.to, args.store)
        .await
        .context("failed to rebuild time series")?;

    if json {
        print_json(&series)?;
    } else {
        for point in &series {
            println!("{}  {}", point.date, point.quantity);
        }
    }
    Ok(())
}

async fn handle_orphans(engine: &InventoryEngine, json: bool) -> Result<()> {
    let rows = engine
        .inventory
        .get_orphaned_items()
        .await
        .context("failed to list orphaned inventory")?;

    if json {
        print_json(&rows)?;
    } else if rows.is_empty() {
        println!("No orphaned inventory rows");
    } else {
        for row in &rows {
            println!("- inventory {} @ store {} • {} units", row.id, row.store_id, row.quantity);
        }
    }
    Ok(())
}

fn render_allocation(result: &AllocationResult) {
    println!(
        "Strategy {} • {} allocated • {} left over",
        result.strategy, result.total_allocated, result.remaining_quantity
    );
    for item in &result.allocated_items {
        println!(
            "- order {} line {} • +{} ({} fulfilled{})",
            item.order_id,
            item.order_item_id,
            item.allocated_quantity,
            item.fulfilled_quantity,
            if item.is_fulfilled { ", complete" } else { "" }
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
