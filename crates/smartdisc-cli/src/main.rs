use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = smartdisc_cli::Cli::parse();
    smartdisc_cli::run_cli(cli)
}
