//! `lngate version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> anyhow::Result<()> {
    println!("lngate version {}", lngate_core::VERSION);
    Ok(())
}
