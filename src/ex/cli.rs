use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;

use crate::ex::{build_info, config, daemon};

#[derive(Debug, Parser)]
#[command(name = "exorsus", about = "Exorsus process supervisor", disable_version_flag = true)]
pub struct Args {
    /// Application configuration directory
    #[arg(short = 'c', long = "config", default_value = "./config/")]
    pub config: PathBuf,

    /// Print version information and exit
    #[arg(long = "version")]
    pub version: bool,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.version {
        println!("{}", build_info::banner());
        return Ok(());
    }

    let cfg = config::Configuration::load(&args.config);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let code = rt.block_on(daemon::run_daemon(cfg, &args.config))?;
    if code != daemon::EXIT_OK {
        std::process::exit(code);
    }
    Ok(())
}
