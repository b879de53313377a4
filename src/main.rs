use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use sensor_gateway::transport::btleplug::BtleplugRadio;
use sensor_gateway::{
    Directive, FileRecordStore, Gateway, GatewayConfig, GatewayError, OperatorSpec, Shutdown,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sensor-gateway", version, about = "Discover, test and operate BLE sensor devices")]
struct Cli {
    /// JSON file overriding the default settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory that receives device records.
    #[arg(long, global = true, default_value = "records")]
    records: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan until the fleet settles and list the sensors heard.
    Scan,
    /// Run randomized health checks.
    Test {
        /// Average time between two tests of the same device.
        #[arg(long)]
        avg_test_secs: f64,
        /// Devices sampled per round.
        #[arg(long)]
        sample_size: usize,
        /// Rounds to run; runs until interrupted when omitted.
        #[arg(long)]
        rounds: Option<u32>,
    },
    /// Run operators on selected devices.
    Run {
        #[arg(long = "device-id")]
        device_ids: Vec<String>,
        #[arg(long)]
        name_prefix: Option<String>,
        /// noop, list, enable-logging, disable-logging, finalize-o2,
        /// finalize-ph, calibrate=<step>, write:<attribute>=<value>
        #[arg(long = "op")]
        ops: Vec<OperatorSpec>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => GatewayConfig::from_json_file(path).await?,
        None => GatewayConfig::default(),
    };

    let shutdown = Shutdown::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            on_ctrl_c.trigger();
        }
    });

    // Leave room for the connection itself inside each attempt's timeout.
    let radio = BtleplugRadio::first_adapter()
        .await?
        .with_lookup_timeout(config.connect_timeout / 2);
    let gateway = Gateway::builder()
        .with_config(config)
        .with_transport(Arc::new(radio))
        .with_store(Arc::new(FileRecordStore::new(&cli.records)))
        .with_shutdown(shutdown)
        .build()?;

    match execute(&gateway, cli.command).await {
        Err(GatewayError::Cancelled) => {
            info!("Stopped");
            Ok(())
        }
        other => Ok(other?),
    }
}

async fn execute(gateway: &Gateway, command: Command) -> Result<(), GatewayError> {
    match command {
        Command::Scan => {
            let devices = gateway.scan().await?;
            for device in devices.iter() {
                println!(
                    "{}  {}  {:>4}  {}",
                    device.device_id(),
                    device.address,
                    device.rssi.map(|r| r.to_string()).unwrap_or_default(),
                    device.local_name.as_deref().unwrap_or("")
                );
            }
        }
        Command::Test {
            avg_test_secs,
            sample_size,
            rounds,
        } => {
            let target = Duration::try_from_secs_f64(avg_test_secs)
                .map_err(|e| GatewayError::Config(format!("--avg-test-secs: {e}")))?;
            let mut round = 0;
            while rounds.is_none_or(|r| round < r) {
                round += 1;
                let outcomes = gateway.run_tests(target, sample_size).await?;
                let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
                info!(
                    "Round {round}: {} tests, {failed} failed",
                    outcomes.len()
                );
            }
        }
        Command::Run {
            device_ids,
            name_prefix,
            ops,
        } => {
            let mut directives = Vec::new();
            if !device_ids.is_empty() {
                directives.push(Directive::device_ids(&device_ids)?);
            }
            if let Some(prefix) = name_prefix {
                directives.push(Directive::name_prefix(prefix));
            }
            for op in ops {
                directives.push(op.into_operator(&gateway.config().attributes)?.into());
            }
            if directives.is_empty() {
                warn!("Nothing selected, scanning all sensors without operators");
            }

            let report = gateway.run_directives(directives).await?;
            for failure in report.failed() {
                if let Err(e) = &failure.result {
                    error!("{}: {e}", failure.device_id);
                }
            }
            info!(
                "{} devices processed, {} succeeded",
                report.devices.len(),
                report.succeeded()
            );
        }
    }
    Ok(())
}
