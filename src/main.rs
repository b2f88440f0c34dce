use clap::Parser;
use loopwright_lib::cli::Cli;
use loopwright_lib::{orchestrator, Config};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    let config = Config::from_cli(cli);

    match orchestrator::run(config).await {
        Ok(worker_exit_code) => std::process::exit(worker_exit_code),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}
