use clap::Parser;

use church_network::cli::{self, Cli};
use church_network::config::loader::load_config;
use church_network::observability::init_logging;

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let project_root = std::env::current_dir().ok();
    let mut config = match load_config(args.config.as_deref(), project_root.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    if let Some(db) = args.db {
        config.database.path = db;
    }

    init_logging(&config.logging.filter);
    tracing::debug!(db = %config.database.path, "configuration loaded");

    if let Err(e) = cli::run(args.command, config).await {
        tracing::error!(code = e.code(), "command failed: {e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
