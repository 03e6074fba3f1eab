//! Relay kernel runner - main entry point.
//!
//! Loads the flat configuration, then either prints it (`--config-keys`,
//! `--print-config`) or starts a runtime and waits for a termination signal.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use relay_kernel::loader::ConfigLoader;
use relay_kernel::types::CONFIG_KEYS;
use relay_kernel::{mask_secrets, observability, Context, Runtime, RuntimeConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "relay-kernel", version, about = "Embeddable event runtime kernel")]
struct Cli {
    /// Print every recognised configuration key and exit
    #[arg(long)]
    config_keys: bool,

    /// Print the resolved configuration with secrets masked and exit
    #[arg(long)]
    print_config: bool,

    /// Output format for --config-keys and --print-config
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Profile selecting application-<profile>.properties
    #[arg(long, env = "RELAY_PROFILE")]
    profile: Option<String>,

    /// Directory holding application.properties
    #[arg(long, env = "RELAY_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Configuration override, highest precedence
    #[arg(short = 'D', value_name = "KEY=VALUE")]
    define: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.config_keys {
        print_config_keys(cli.format)?;
        return Ok(());
    }

    let mut loader = ConfigLoader::new()
        .config_dir(&cli.config_dir)
        .overrides(cli.define.iter().map(String::as_str))?;
    if let Some(profile) = &cli.profile {
        loader = loader.profile(profile);
    }
    let entries = loader.load()?;

    if cli.print_config {
        let masked = mask_secrets(&entries);
        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&masked)?),
            OutputFormat::Text => {
                for (key, value) in &masked {
                    println!("{key}={value}");
                }
            }
        }
        return Ok(());
    }

    let config = RuntimeConfig::from_context(&Context::new(&entries))?;
    observability::init_tracing(&config);

    let runtime = Runtime::builder()
        .entries(entries)
        .config(config)
        .build()?;
    tracing::info!(trace_id = %runtime.context().trace_id(), "relay_kernel_running");

    runtime.run_until_signal().await?;
    tracing::info!(stats = ?runtime.stats(), "relay_kernel_stopped");
    Ok(())
}

fn print_config_keys(format: OutputFormat) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(CONFIG_KEYS)?),
        OutputFormat::Text => {
            let width = CONFIG_KEYS.iter().map(|k| k.key.len()).max().unwrap_or(0);
            for key in CONFIG_KEYS {
                let default = if key.default.is_empty() { "-" } else { key.default };
                println!("{:<width$}  {} (default: {})", key.key, key.description, default);
            }
        }
    }
    Ok(())
}
