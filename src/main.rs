use log::{error, info};
use netlens::config::Config;
use netlens::logging::setup_logging;
use netlens::render::print_report;
use netlens::{Monitor, MonitorError};
use std::path::PathBuf;

const USAGE: &str = "Usage: netlens [--config <path>] [--once]

  --config <path>  configuration file (default: netlens.yaml next to the binary, then ./netlens.yaml)
  --once           run a single tick and exit
  -h, --help       show this help";

struct Args {
    config: Option<PathBuf>,
    once: bool,
}

fn parse_args() -> Result<Option<Args>, MonitorError> {
    let mut args = Args {
        config: None,
        once: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter
                    .next()
                    .ok_or_else(|| MonitorError::Config("--config requires a path".to_string()))?;
                args.config = Some(PathBuf::from(path));
            }
            "--once" => args.once = true,
            "-h" | "--help" => return Ok(None),
            other => return Err(MonitorError::Config(format!("unknown argument '{}'\n\n{}", other, USAGE))),
        }
    }
    Ok(Some(args))
}

fn main() -> Result<(), MonitorError> {
    let Some(args) = parse_args()? else {
        println!("{}", USAGE);
        return Ok(());
    };

    let config_path = Config::locate(args.config.as_deref());
    let config = Config::load_or_default(&config_path);

    setup_logging(&config.logging)?;
    info!("netlens starting, config: {}", config_path.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        let mut monitor = Monitor::from_config(config);
        monitor.run(args.once, print_report).await
    });

    if let Err(e) = &result {
        error!("Monitor stopped: {}", e);
    }
    result
}
