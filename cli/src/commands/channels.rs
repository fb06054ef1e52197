//! `lngate channels` command - Replay channel events through the resolver.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use lngate_channels::{ChannelEvent, ChannelEventPump, ChannelIdentityResolver};
use lngate_core::GateConfig;
use serde_json::json;

use crate::input;
use crate::output;

#[derive(Args)]
pub struct ChannelsArgs {
    /// Recorded channel events, one JSON event per line
    #[arg(long)]
    pub events: PathBuf,

    /// Allocate this many trusted-funding aliases before replaying
    #[arg(long, default_value_t = 0)]
    pub propose: usize,

    /// Resolve these ids after the replay
    #[arg(long = "resolve")]
    pub resolve: Vec<String>,

    /// Print JSON lines instead of tables
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ChannelsArgs, config: GateConfig) -> anyhow::Result<()> {
    let events: Vec<ChannelEvent> = input::read_jsonl(&args.events)?;
    let resolver = Arc::new(ChannelIdentityResolver::new(&config.channels));
    let pump = ChannelEventPump::new(Arc::clone(&resolver), events.len().max(1));

    for _ in 0..args.propose {
        if let Some(alias) = resolver.propose(true) {
            if args.json {
                output::print_json(&json!({ "kind": "proposed", "alias": alias }))?;
            } else {
                println!("proposed {alias}");
            }
        }
    }

    for event in &events {
        match pump.apply(event) {
            Ok(resolved) if args.json => output::print_json(&resolved)?,
            Ok(resolved) => println!(
                "{:?} {} ({})",
                resolved.kind,
                resolved.id,
                resolved.identity.state
            ),
            Err(e) => {
                tracing::warn!(channel = %event.id(), error = %e, "Channel event not applied");
                if args.json {
                    output::print_json(&json!({
                        "kind": "rejected",
                        "id": event.id(),
                        "error": e.to_failure(),
                    }))?;
                } else {
                    println!("rejected {}: {}", event.id(), e);
                }
            }
        }
    }

    for id in &args.resolve {
        match resolver.resolve(id) {
            Ok(identity) if args.json => {
                output::print_json(&json!({ "kind": "resolved", "query": id, "identity": identity }))?
            }
            Ok(identity) => println!("{id} -> {} ({})", identity.current_id, identity.state),
            Err(e) if args.json => {
                output::print_json(&json!({ "kind": "unresolved", "query": id, "error": e.to_failure() }))?
            }
            Err(e) => println!("{id} -> {e}"),
        }
    }

    let ephemeral = resolver.ephemeral_ids();
    if args.json {
        output::print_json(&json!({ "kind": "ephemeral_ids", "channels": ephemeral }))?;
        return Ok(());
    }

    println!();
    let mut table = output::new_table(&["REFERENCE ID", "OTHER IDS", "STATE"]);
    for entry in &ephemeral {
        let state = resolver
            .resolve(&entry.reference_id)
            .map(|identity| identity.state.to_string())
            .unwrap_or_default();
        table.add_row([
            entry.reference_id.clone(),
            entry.other_ids.join(", "),
            state,
        ]);
    }
    println!("{table}");
    Ok(())
}
