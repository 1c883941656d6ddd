//! Lifecycle extension binary

use clap::Parser;
use leaf_extension::config::{ExtensionArgs, ExtensionConfig, LogFormat};
use leaf_extension::{extension, ExtensionError, Result};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    if let Err(e) = run() {
        error!(error = %e, "Extension exiting with failure");
        eprintln!("leaf-extension failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let args = ExtensionArgs::parse();

    // An invalid format is reported by from_args once logging is up
    let log_format = args.log_format.parse::<LogFormat>().unwrap_or_default();
    init_logging(&args.log_level, log_format);

    let config = match ExtensionConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to create configuration");
            return Err(e);
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return Err(ExtensionError::Io(e));
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        extension = %config.extension_name,
        "Starting extension"
    );
    runtime.block_on(extension::run(&config))?;
    Ok(())
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(filter)
        .init();
}
