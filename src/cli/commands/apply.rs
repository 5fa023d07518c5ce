//! Apply command implementation.

use super::{init_tracing, load_config, memory_registry};
use crate::core::config::ConfigOverrides;
use crate::core::runtime::Runtime;
use crate::plugins::DesiredState;
use crate::scheduler::{KeyReport, RefreshReport, TxnReport};
use anyhow::Result;
use clap::Args;
use serde_json::{json, Value as JsonValue};
use std::path::{Path, PathBuf};

/// Apply a desired-state file once.
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Desired-state JSON file.
    #[arg(long)]
    pub state: PathBuf,

    /// Output format (text, json).
    #[arg(long, default_value = "text")]
    pub format: String,

    /// Run a refresh after the transaction and report drift.
    #[arg(long)]
    pub refresh: bool,
}

/// Run the apply command.
pub async fn run_apply(
    args: ApplyArgs,
    config_path: &Path,
    overrides: &ConfigOverrides,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    init_tracing(&config.telemetry.log_level);

    let state = DesiredState::from_file(&args.state)?;
    let (registry, _dataplane) = memory_registry()?;
    let mut runtime = Runtime::new(config, registry)?;
    runtime.start().await?;

    let report = runtime.commit(state.to_transaction()).await?;
    let refresh = if args.refresh {
        Some(runtime.refresh().await?)
    } else {
        None
    };
    runtime.stop().await?;

    match args.format.as_str() {
        "json" => {
            let mut out = report_json(&report);
            if let Some(refresh) = &refresh {
                out["refresh"] = refresh_json(refresh);
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        _ => {
            print!("{}", report);
            if let Some(refresh) = &refresh {
                print_refresh(refresh);
            }
        }
    }

    if !report.is_committed() {
        anyhow::bail!(
            "transaction #{} {}: {} failed, {} pending",
            report.seq,
            report.state,
            report.failed_keys().len(),
            report.pending_keys().len()
        );
    }
    Ok(())
}

fn print_refresh(refresh: &RefreshReport) {
    if refresh.is_clean() {
        println!("refresh: no drift");
        return;
    }
    println!("refresh:");
    for drift in &refresh.drifts {
        println!("  {} {} ({})", drift.kind, drift.key, drift.descriptor);
    }
    for (descriptor, err) in &refresh.failed_dumps {
        println!("  dump failed for {}: {}", descriptor, err);
    }
}

fn key_json(report: &KeyReport) -> JsonValue {
    json!({
        "key": report.key,
        "status": report.status.to_string(),
        "error_kind": report.status.error().map(|e| e.kind().as_str()),
    })
}

fn report_json(report: &TxnReport) -> JsonValue {
    json!({
        "seq": report.seq,
        "kind": report.kind.to_string(),
        "state": report.state.to_string(),
        "keys": report.keys.iter().map(key_json).collect::<Vec<_>>(),
        "side_effects": report.side_effects.iter().map(key_json).collect::<Vec<_>>(),
        "executed": report.executed.iter().map(|op| json!({
            "key": op.key,
            "descriptor": op.descriptor,
            "op": op.op.to_string(),
            "reason": format!("{:?}", op.reason).to_lowercase(),
            "elapsed_ms": op.elapsed_ms,
            "error": op.error.as_ref().map(|e| e.to_string()),
        })).collect::<Vec<_>>(),
    })
}

fn refresh_json(refresh: &RefreshReport) -> JsonValue {
    json!({
        "drifts": refresh.drifts.iter().map(|d| json!({
            "key": d.key,
            "descriptor": d.descriptor,
            "kind": d.kind.to_string(),
        })).collect::<Vec<_>>(),
        "failed_dumps": refresh.failed_dumps.iter().map(|(name, err)| json!({
            "descriptor": name,
            "error": err.to_string(),
        })).collect::<Vec<_>>(),
        "txn": refresh.txn.as_ref().map(report_json),
    })
}
