use std::process::ExitCode;

use clap::Parser;

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    volley_common::logging::init();

    let cli = volley::cli::Cli::parse();
    volley::run(cli).await
}
