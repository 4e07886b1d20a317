use anyhow::Result;
use attachment_relay::cli::{self, Cli, Commands};
use attachment_relay::config::Config;
use attachment_relay::error::PipelineError;
use attachment_relay::models::Provider;
use attachment_relay::pipeline::Orchestrator;
use attachment_relay::{server, tools};
use clap::Parser;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("\nFor help, run: attachment-relay --help");
            process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    // Install default crypto provider for rustls
    // On non-Windows platforms, use aws-lc-rs; on Windows, use ring
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    // Values from .env never override variables already set in the environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("attachment_relay=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("attachment_relay=info,warn"))
    };

    // stdout carries tool output, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                return Err(PipelineError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(&output).await?;
            println!("Created example configuration file at: {:?}", output);
            println!("\nSet storage.client_id (or MSFT_CLIENT_ID) before running storage tools.");
            Ok(0)
        }

        Commands::Tools => {
            let definitions = serde_json::json!({ "tools": tools::definitions() });
            println!("{}", serde_json::to_string_pretty(&definitions)?);
            Ok(0)
        }

        Commands::Serve { host, port } => {
            let config = Config::load(&cli.config).await?;
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let orchestrator = Arc::new(Orchestrator::from_config(&config));

            server::serve(orchestrator, &host, port).await?;
            Ok(0)
        }

        Commands::Run { tool, input } => {
            let input = cli::parse_input(&input)?;
            let config = Config::load(&cli.config).await?;
            let orchestrator = Orchestrator::from_config(&config);

            let outcome = orchestrator.run(&tool, &input).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&cli::render_outcome(&outcome))?
            );
            Ok(if outcome.is_ok() { 0 } else { 1 })
        }

        Commands::Auth { provider, force } => {
            let config = Config::load(&cli.config).await?;
            let orchestrator = Orchestrator::from_config(&config);
            let credentials = orchestrator.credentials();
            let provider: Provider = provider.into();

            if force {
                credentials.invalidate(provider).await?;
            }

            let token = credentials.acquire(provider).await?;
            let slot = credentials.provider(provider);
            println!(
                "Authenticated {} via {} flow",
                provider,
                slot.grant_kind()
            );
            println!("Token cached at: {:?}", slot.token_path());
            if let Some(expires_at) = token.expires_at {
                println!("Access token expires: {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            Ok(0)
        }
    }
}
