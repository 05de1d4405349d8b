pub mod app;
pub mod asyncutil;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod process;
pub mod rest;
pub mod status;
pub mod store;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
