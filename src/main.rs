use clap::Parser as _;
use systemair_save_hass::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_ENV: &str = "SYSTEMAIR_SAVE_HASS_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Entities(commands::entities::Args),
    Read(commands::read::Args),
    Set(commands::set::Args),
    Bridge(commands::bridge::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: {LOG_ENV} is not a valid filter");
            eprintln!("  because: {e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Entities(args) => end(commands::entities::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Set(args) => end(commands::set::run(args)),
        Commands::Bridge(args) => end(commands::bridge::run(args)),
    }
}
