//! converge: drive remote resources to a declared state
//!
//! Subcommands:
//! - `plan`: show the differences and the operations an apply would run
//! - `apply`: reconcile once and print the resulting state
//! - `delete`: delete the resource a desired-state file addresses
//! - `list`: list resources under a parent scope
//! - `schema`: print the field table of a resource kind

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use converge_core::config::load_environment;
use converge_core::EngineConfig;
use converge_engine::schemas::{builtin, instance_group_manager};
use converge_engine::{Lifecycle, Reconciler};
use converge_rest::RestApi;

mod input;

use input::{load_state, override_key, parse_lifecycle};

#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(about = "Declarative reconciliation of remote resources")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resource kind
    #[arg(short, long, global = true, default_value = instance_group_manager::KIND)]
    kind: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what apply would do, without changing anything
    Plan {
        /// Desired state file (JSON or TOML)
        path: PathBuf,

        /// Fetch the existing resource under a different identity (field=value)
        #[arg(long)]
        hint: Vec<String>,
    },
    /// Reconcile the resource to the desired state
    Apply {
        /// Desired state file (JSON or TOML)
        path: PathBuf,

        /// Fetch the existing resource under a different identity (field=value)
        #[arg(long)]
        hint: Vec<String>,

        /// Refuse a step: block-creation, block-acquire, block-modification, block-destruction
        #[arg(long = "block", value_parser = parse_lifecycle)]
        lifecycle: Vec<Lifecycle>,
    },
    /// Delete the resource addressed by a state file
    Delete {
        path: PathBuf,
    },
    /// List resources in the scope of a state file's parent fields
    List {
        path: PathBuf,
    },
    /// Print the field table of the resource kind
    Schema,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("converge=info".parse()?)
        .add_directive("converge_engine=info".parse()?)
        .add_directive("converge_rest=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from /etc/converge/environment (if exists)
    let env_file = load_environment();

    let args = Args::parse();
    init_tracing(args.json)?;
    if let Some(path) = env_file {
        debug!("Environment loaded from {}", path);
    }

    let resource_type = builtin(&args.kind)?;
    if let Commands::Schema = args.command {
        return print(&resource_type.describe());
    }

    let config = EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let api = Arc::new(RestApi::with_builtin_routes(&config.api)?);
    info!("Using management API at {}", api.base_url());

    // Ctrl-C cancels the in-flight pass; remote jobs keep running
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let reconciler = Reconciler::from_config(api, resource_type.clone(), &config);

    match args.command {
        Commands::Plan { path, hint } => {
            let desired = load_state(&path)?;
            let hint = hint_key(&reconciler, &desired, &hint)?;
            let plan = reconciler.plan(&desired, hint.as_ref(), &cancel).await?;
            for diff in &plan.diffs {
                info!("{}", diff);
            }
            print(&plan)?;
        }
        Commands::Apply {
            path,
            hint,
            lifecycle,
        } => {
            let desired = load_state(&path)?;
            let hint = hint_key(&reconciler, &desired, &hint)?;
            let reconciler = reconciler.with_lifecycle(lifecycle);
            let outcome = reconciler.reconcile(&desired, hint.as_ref(), &cancel).await?;
            print(&outcome)?;
        }
        Commands::Delete { path } => {
            let desired = load_state(&path)?;
            reconciler.delete(&desired, &cancel).await?;
            info!("Deleted {}", resource_type.key_for(&desired)?);
        }
        Commands::List { path } => {
            let parent = load_state(&path)?;
            let items: Vec<Value> = reconciler.list_all(&parent).await?;
            print(&items)?;
        }
        Commands::Schema => {}
    }

    Ok(())
}

fn hint_key(
    reconciler: &Reconciler,
    desired: &Value,
    overrides: &[String],
) -> Result<Option<converge_core::ResourceKey>> {
    if overrides.is_empty() {
        return Ok(None);
    }
    let target = reconciler.resource_type().key_for(desired)?;
    Ok(Some(override_key(target, overrides)?))
}
