use anyhow::{bail, Result};
use edge_sync_service::{config::AppConfig, observability, store::PgStore, sync::UploadStatistics};
use meter_client::db::sync_log_queries;
use std::env;
use time::OffsetDateTime;

/// Print upload backlog and recent sync-log statistics for the edge store.
///
/// usage: sync-status [window_hours] [--json]
#[tokio::main]
async fn main() -> Result<()> {
    let mut window_hours: Option<u32> = None;
    let mut json = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            other => match other.parse() {
                Ok(hours) => window_hours = Some(hours),
                Err(_) => bail!("usage: sync-status [window_hours] [--json]"),
            },
        }
    }

    let cfg = AppConfig::load()?;
    observability::init_tracing(&cfg.logging)?;
    let window_hours = window_hours.unwrap_or(cfg.upload.stats_window_hours);
    let store = PgStore::connect(&cfg.edge_store.uri, 1).await?;

    let stats = UploadStatistics::collect(&store, window_hours, cfg.upload.max_retry_count).await?;
    let since = OffsetDateTime::now_utc() - time::Duration::hours(i64::from(window_hours));
    let mut recent = sync_log_queries::recent_sync_logs(store.pool(), since).await?;
    recent.truncate(10);

    if json {
        let out = serde_json::json!({ "statistics": stats, "recent": recent });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let s = &stats.summary;
    println!("queue size:        {}", stats.queue_size);
    println!(
        "stuck rows:        {} (retry_count >= {})",
        stats.stuck_rows, cfg.upload.max_retry_count
    );
    println!("window:            last {window_hours}h");
    println!("attempts:          {} ({} ok, {} failed)", s.attempts, s.successes, s.failures);
    println!("rows synced:       {}", s.rows_synced);
    match s.last_success_at {
        Some(at) => println!("last success:      {at}"),
        None => println!("last success:      never"),
    }
    if !recent.is_empty() {
        println!();
        println!("recent sync attempts:");
        for log in &recent {
            let outcome = if log.success { "ok" } else { "FAILED" };
            let error = log.error_message.as_deref().unwrap_or("");
            println!("  {}  {:>6} rows  {outcome:<6} {error}", log.synced_at, log.batch_size);
        }
    }
    Ok(())
}
