use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keeper_client::{ClientConfig, HttpProjectClient};
use keeper_core::{Labels, PreviousState, Project, ProjectId, ProjectSpec};
use keeper_reconcile::{Reconciler, ReconcilerConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "keeperctl", version, about = "Keeper CLI: reconcile control-plane projects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Budget for the whole operation, including waiting for convergence
    #[arg(long = "timeout", global = true, env = "KEEPER_TIMEOUT_SECS", default_value_t = 1200)]
    timeout_secs: u64,

    /// Control plane endpoint (overrides KEEPER_ENDPOINT)
    #[arg(long = "endpoint", global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCmd),
}

#[derive(Subcommand, Debug)]
enum ProjectCmd {
    /// Create a project and wait until it is Active
    Create {
        #[arg(long = "name")]
        name: String,
        /// Label as key=value; repeatable
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Show a project
    Get { id: String },
    /// Change name and/or labels; given labels replace the whole set
    Update {
        id: String,
        #[arg(long = "name")]
        name: Option<String>,
        /// Label as key=value; repeatable
        #[arg(long = "label", value_parser = parse_label, conflicts_with = "clear_labels")]
        labels: Vec<(String, String)>,
        /// Remove every label
        #[arg(long = "clear-labels", action = ArgAction::SetTrue)]
        clear_labels: bool,
    },
    /// Delete a project and wait until it is gone
    Delete { id: String },
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("invalid label '{}' (expect key=value)", s)),
    }
}

/// Desired state for `update`: unspecified fields keep their current values.
fn desired_for_update(current: &Project, name: Option<String>, labels: Vec<(String, String)>, clear_labels: bool) -> ProjectSpec {
    let labels: Labels = if clear_labels {
        Labels::new()
    } else if labels.is_empty() {
        current.labels.clone()
    } else {
        labels.into_iter().collect()
    };
    ProjectSpec { name: name.unwrap_or_else(|| current.name.clone()), labels: Some(labels) }
}

fn init_tracing() {
    let env = std::env::var("KEEPER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEPER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEPER_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_project(output: Output, p: &Project) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<16} {:<24} {:<12} {:<26} LABELS", "ID", "NAME", "STATUS", "CREATED");
            let labels: Vec<String> = p.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            println!(
                "{:<16} {:<24} {:<12} {:<26} {}",
                p.id,
                p.name,
                p.status,
                p.creation_timestamp,
                if labels.is_empty() { "-".to_string() } else { labels.join(",") }
            );
            if let Some(ts) = &p.deletion_timestamp {
                println!("deletion requested at {}", ts);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(p)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut client_cfg = ClientConfig::from_env()?;
    if let Some(ep) = &cli.endpoint {
        client_cfg.endpoint = url::Url::parse(ep).with_context(|| format!("parsing --endpoint '{}'", ep))?;
    }
    let client = HttpProjectClient::new(client_cfg)?;
    let reconciler = Reconciler::new(client, ReconcilerConfig::from_env());
    let timeout = Duration::from_secs(cli.timeout_secs);

    match cli.command {
        Commands::Project(cmd) => match cmd {
            ProjectCmd::Create { name, labels } => {
                let mut desired = ProjectSpec::new(name);
                if !labels.is_empty() {
                    desired = desired.with_labels(labels.into_iter().collect());
                }
                info!(name = %desired.name, "create invoked");
                let p = reconciler.create(&desired, timeout).await?;
                print_project(cli.output, &p)?;
            }
            ProjectCmd::Get { id } => {
                let id = ProjectId::new(id);
                match reconciler.read(&id, timeout).await? {
                    Some(p) => print_project(cli.output, &p)?,
                    None => match cli.output {
                        Output::Human => println!("project '{}' not found", id),
                        Output::Json => println!("null"),
                    },
                }
            }
            ProjectCmd::Update { id, name, labels, clear_labels } => {
                let id = ProjectId::new(id);
                let current = reconciler
                    .read(&id, timeout)
                    .await?
                    .with_context(|| format!("update project '{}': project not found", id))?;
                let desired = desired_for_update(&current, name, labels, clear_labels);
                let p = reconciler.update(&id, &desired, &PreviousState::from(&current), timeout).await?;
                print_project(cli.output, &p)?;
            }
            ProjectCmd::Delete { id } => {
                let id = ProjectId::new(id);
                reconciler.delete(&id, timeout).await?;
                match cli.output {
                    Output::Human => println!("project '{}' deleted", id),
                    Output::Json => println!("{}", serde_json::json!({ "id": id.as_str(), "deleted": true })),
                }
            }
        },
    }

    Ok(())
}
