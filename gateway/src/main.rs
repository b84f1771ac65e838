use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use tokend::cli::{self, Commands, ServeArgs, TokenCommands};
use tokend::config::{self, Config, LogFormat};
use tokend::models::Identity;
use tokend::{api, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let mut cfg = config::load()?;
    if let Some(Commands::Serve(serve)) = &args.command {
        apply_overrides(&mut cfg, serve);
    }

    init_tracing(&cfg)?;

    let result = match args.command {
        Some(Commands::Serve(_)) | None => run_server(cfg).await,
        Some(Commands::Token { command }) => {
            let state = AppState::from_config(cfg)?;
            handle_token_command(command, &state).await
        }
        Some(Commands::Prune { retention }) => {
            let state = AppState::from_config(cfg)?;
            handle_prune_command(retention, &state).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    opentelemetry::global::shutdown_tracer_provider();
    result
}

fn apply_overrides(cfg: &mut Config, args: &ServeArgs) {
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(host) = &args.host {
        cfg.host = host.clone();
    }
    if let Some(dir) = &args.token_dir {
        cfg.token_dir = dir.clone();
    }
    if let Some(instance) = &args.instance {
        cfg.instance = instance.clone();
    }
}

/// Text or JSON logs filtered by `RUST_LOG`, plus OTLP export when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
fn init_tracing(cfg: &Config) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "tokend"),
                KeyValue::new("service.instance.id", cfg.instance.clone()),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let fmt_layer = match cfg.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tokend=debug,tower_http=debug".into()),
        ))
        .with(fmt_layer)
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn run_server(cfg: Config) -> anyhow::Result<()> {
    if cfg.admin_key.is_none() {
        tracing::warn!("TOKEND_ADMIN_KEY is not set: the token API is open to anyone who can reach it");
    }

    let addr = cfg.bind_addr();
    let instance = cfg.instance.clone();
    let state = Arc::new(AppState::from_config(cfg).context("failed to open token store")?);

    if let Some(retention) = state.config.retention {
        jobs::cleanup::spawn(
            state.service.clone(),
            state.config.cleanup_interval,
            retention,
        );
        tracing::info!(
            every_secs = state.config.cleanup_interval.as_secs(),
            retention_secs = retention.as_secs(),
            "background cleanup job started"
        );
    }

    let app = api::app(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(instance = %instance, "tokend listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn handle_token_command(cmd: TokenCommands, state: &AppState) -> anyhow::Result<()> {
    let service = &state.service;
    let parse = |raw: String| Identity::parse(raw).context("invalid identity");

    match cmd {
        TokenCommands::Issue { identity, ttl } => {
            let issued = service
                .issue(parse(identity)?, ttl.map(Duration::from_secs))
                .await?;
            let expires = issued
                .record
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into());
            println!(
                "Token issued:\n  Identity: {}\n  Expires:  {}\n  Value:    {}",
                issued.record.identity,
                expires,
                issued.value.expose()
            );
            println!("Store the value now; it cannot be shown again.");
        }
        TokenCommands::Validate { identity, value } => {
            let valid = service.validate(&parse(identity)?, &value).await?;
            println!("{}", if valid { "valid" } else { "invalid" });
            if !valid {
                std::process::exit(1);
            }
        }
        TokenCommands::Revoke { identity } => {
            let record = service.revoke(parse(identity)?).await?;
            println!("Token for '{}' revoked.", record.identity);
        }
        TokenCommands::Renew { identity, ttl } => {
            let record = service
                .renew(parse(identity)?, ttl.map(Duration::from_secs))
                .await?;
            let expires = record
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into());
            println!("Token for '{}' renewed, expires {}.", record.identity, expires);
        }
        TokenCommands::Status { identity } => {
            let status = service.status(&parse(identity)?).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        TokenCommands::List => {
            let tokens = service.list().await?;
            if tokens.is_empty() {
                println!("No tokens found.");
            } else {
                println!("{:<40} {:<8} {:<26} {:<6}", "IDENTITY", "STATE", "EXPIRES", "RENEW");
                for t in tokens {
                    let expires = t
                        .expires_at
                        .map(|e| e.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| "never".into());
                    let state = serde_json::to_value(t.state)?;
                    println!(
                        "{:<40} {:<8} {:<26} {:<6}",
                        t.identity,
                        state.as_str().unwrap_or("?"),
                        expires,
                        t.needs_renewal
                    );
                }
            }
        }
        TokenCommands::Purge { identity } => {
            let identity = parse(identity)?;
            service.purge(identity.clone()).await?;
            println!("Token record for '{}' purged.", identity);
        }
    }
    Ok(())
}

async fn handle_prune_command(retention: Option<u64>, state: &AppState) -> anyhow::Result<()> {
    let retention = retention
        .map(Duration::from_secs)
        .or(state.config.retention)
        .context("no retention window: pass --retention or set TOKEND_RETENTION")?;
    let purged = state.service.prune(retention).await?;
    println!("Pruned {} token record(s).", purged);
    Ok(())
}
