mod config;

use std::env;
use std::sync::Arc;

use courier_error::{ErrorReport, RelayError};
use courier_imap::{ImapTransport, MimeParser};
use courier_relay::{DeliveryClient, Pipeline, SessionController};
use courier_slack::SlackAdapter;
use tracing::{error, info};

use crate::config::Config;

const CRATES: [&str; 5] = [
    "courier",
    "courier_relay",
    "courier_imap",
    "courier_slack",
    "courier_domain",
];

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let default = CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .compact()
        .init();
}

async fn run_relay(config: Config) -> Result<(), RelayError> {
    let rules = config.rules()?;
    info!(
        rules = rules.len(),
        dry_run = config.dryrun,
        mailbox = %config.mail.mailbox,
        "starting relay"
    );

    let transport = Arc::new(ImapTransport::new(config.imap_config()?));
    let chat = Arc::new(SlackAdapter::new(config.slack_config()?)?);
    let delivery = DeliveryClient::new(chat, config.retry_policy(), config.dryrun);
    let pipeline = Pipeline::new(
        Arc::new(MimeParser),
        rules,
        delivery,
        config.pipeline_options(),
    );
    let controller = SessionController::new(transport, pipeline, config.session_options());

    tokio::select! {
        result = controller.run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| RelayError::internal(format!("signal handler: {e}")))?;
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

fn run_check(config: &Config) -> Result<(), RelayError> {
    let rules = config.rules()?;
    config.imap_config()?;
    config.slack_config()?;
    eprintln!(
        "configuration ok: {} filter rule(s), mailbox {} on {}:{}{}",
        rules.len(),
        config.mail.mailbox,
        config.mail.host,
        config.mail.port,
        if config.dryrun { " (dry run)" } else { "" }
    );
    Ok(())
}

fn print_usage() {
    eprintln!("courier: relay mail from an IMAP mailbox to Slack");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  courier [run] [--config PATH]   Run the relay (default)");
    eprintln!("  courier check [--config PATH]   Validate the configuration and exit");
    eprintln!("  courier help                    Show this help");
    eprintln!();
    eprintln!("Configuration file:");
    eprintln!(
        "  --config PATH, else ${}, else {}",
        config::CONFIG_ENV,
        config::DEFAULT_CONFIG_PATH
    );
    eprintln!("  Secrets may be written as \"env:NAME\" to read them from the environment.");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG   Log filter (default: courier=info, debug when \"debug\": true)");
}

struct Args {
    command: String,
    config: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut command = None;
    let mut config = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().ok_or("--config requires a path")?;
                config = Some(path.clone());
            }
            other if other.starts_with("--config=") => {
                config = Some(other.trim_start_matches("--config=").to_string());
            }
            "--help" | "-h" => command = Some("help".to_string()),
            other if command.is_none() && !other.starts_with('-') => {
                command = Some(other.to_string());
            }
            other => return Err(format!("unexpected argument: {other}")),
        }
    }
    Ok(Args {
        command: command.unwrap_or_else(|| "run".to_string()),
        config,
    })
}

fn fail(err: &RelayError) -> ! {
    error!(report = %ErrorReport::from(err).to_compact(), "fatal error");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Run `courier help` for usage");
            std::process::exit(2);
        }
    };

    match args.command.as_str() {
        "help" => {
            print_usage();
            return;
        }
        "run" | "check" => {}
        unknown => {
            eprintln!("Unknown command: {unknown}");
            eprintln!("Run `courier help` for usage");
            std::process::exit(2);
        }
    }

    let path = config::resolve_path(args.config.as_deref());
    let loaded = Config::load(&path);
    init_tracing(loaded.as_ref().is_ok_and(|c| c.debug));

    let config = match loaded {
        Ok(config) => config,
        Err(e) => fail(&e),
    };
    info!(path = %path, "configuration loaded");

    let result = if args.command == "check" {
        run_check(&config)
    } else {
        run_relay(config).await
    };

    if let Err(e) = result {
        fail(&e);
    }
}
