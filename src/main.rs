use anyhow::Result;
use clap::Parser;
use mailworker::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run()
}
