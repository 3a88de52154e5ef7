use anyhow::Context;
use clap::{Parser, Subcommand};
use nvt_live::nvt_config::ConfigArgs;
use nvt_live::nvt_controllers::{NVTControllers, Tracker};
use nvt_live::nvt_upstream::HttpUpstream;
use nvt_live::nvt_views::NVTViews;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "nvt-live", version, about = "Live Sundsvall bus positions, snapped to their routes")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refreshing table of vehicles on the monitored lines (default)
    Watch {
        /// Seconds between updates
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,
    },
    /// Print one snapshot of snapped vehicles as JSON
    Once,
    /// Print route geometry as a GeoJSON FeatureCollection
    Shapes,
    /// Print the route list as JSON
    Routes,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.into_config().context("Invalid configuration")?;
    let upstream = Arc::new(HttpUpstream::new(config.fetch_timeout)?);
    let tracker = Tracker::new(config, upstream);

    match cli.command.unwrap_or(Command::Watch { interval: 10 }) {
        Command::Watch { interval } => {
            NVTControllers::watch(&tracker, Duration::from_secs(interval), None).await;
        }
        Command::Once => {
            let snapshot = NVTControllers::once_json(&tracker)
                .await
                .inspect_err(|e| NVTViews::network_error(&e.to_string()))
                .context("Failed to fetch vehicle positions")?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Shapes => {
            let shapes = NVTControllers::shapes_geojson(&tracker)
                .await
                .context("Failed to load route shapes")?;
            println!("{}", geojson::GeoJson::from(shapes));
        }
        Command::Routes => {
            let routes = NVTControllers::routes_json(&tracker)
                .await
                .context("Failed to load routes")?;
            println!("{}", serde_json::to_string_pretty(&routes)?);
        }
    }
    Ok(())
}

fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n{}", "═".repeat(70));
        eprintln!("❌ APPLICATION PANIC");
        eprintln!("{}", "═".repeat(70));
        eprintln!("\nThe application encountered an unexpected error:");
        eprintln!("{}", panic_info);
        eprintln!("\n💡 Troubleshooting:");
        eprintln!("  • Please restart the application");
        eprintln!("  • Run with RUST_LOG=debug for more detail");
        eprintln!("  • Report this issue if it persists");
        eprintln!("\n{}", "═".repeat(70));
    }));

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("❌ Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("\n❌ {:#}", e);
        std::process::exit(1);
    }
}
