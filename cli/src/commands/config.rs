//! `lngate config` command.

use clap::Args;
use lngate_core::GateConfig;

#[derive(Args)]
pub struct ConfigArgs {
    /// Print as JSON instead of YAML
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ConfigArgs, config: GateConfig) -> anyhow::Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}
