use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use pin_core::{Ledger, Pin, PinQuery, PinSort, Timestamp};
use pin_ledger_redb::RedbLedger;
use pin_node::config::{NodeConfigLedger, PinNodeConfig};

use crate::PinsCmd;

fn open_ledger(config: &PinNodeConfig, node_config_file: &Path) -> Result<RedbLedger> {
    let NodeConfigLedger::Redb { path } = &config.ledger else {
        bail!("this node keeps its ledger in memory, there is nothing to inspect");
    };
    let path = match node_config_file.parent() {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.clone(),
    };
    RedbLedger::open(&path).with_context(|| format!("failed to open ledger at {path:?}"))
}

fn format_ts(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn summary_line(pin: &Pin) -> String {
    let confirmed = pin.allocations.iter().filter(|a| a.is_confirmed()).count();
    let median = pin
        .median_size
        .map(|m| m.to_string())
        .unwrap_or_else(|| "-".to_owned());
    format!(
        "{}  {:<8}  {}/{} peers  median {}  created {}",
        pin.cid,
        pin.status.as_str(),
        confirmed,
        pin.allocation_count,
        median,
        format_ts(pin.created_at)
    )
}

pub async fn run_pins(cmd: PinsCmd, config: &PinNodeConfig, node_config_file: &Path) -> Result<()> {
    let ledger = open_ledger(config, node_config_file)?;
    match cmd {
        PinsCmd::List { limit } => {
            let query = PinQuery::new().sort_by(PinSort::CreatedAtDesc).limit(limit);
            let pins = ledger.find(&query).await?;
            if pins.is_empty() {
                println!("no pins");
            }
            for pin in &pins {
                println!("{}", summary_line(pin));
            }
        }
        PinsCmd::Show { cid } => {
            let pin = ledger
                .get(&cid)
                .await?
                .with_context(|| format!("no pin for {cid}"))?;
            println!("{}", serde_json::to_string_pretty(&pin)?);
        }
    }
    Ok(())
}
