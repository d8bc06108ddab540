use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use stagehand::config::{self, Config, DEFAULT_CONFIG_YAML};
use stagehand::engine::Engine;
use stagehand::error::{HarnessError, ProcessErrorDetails};
use stagehand::{Lifecycle, Orchestration, OutputClassifier};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about = "Docker compose test environment driver")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long = "compose-file", global = true)]
    compose_file: Vec<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify `docker compose` output read from stdin.
    Classify {
        #[arg(long)]
        teardown: bool,
        #[arg(long)]
        project: Option<String>,
    },
    /// List the services of the compose topology.
    Services,
    /// Bring the environment up, pass a sync barrier on services, tear down.
    Check {
        #[arg(long = "service")]
        services: Vec<String>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    compose_file_overrides: Vec<PathBuf>,
    json: bool,
}

fn main() -> Result<(), HarnessError> {
    stagehand::init_tracing();
    let cli = Cli::parse();
    let ctx = Context {
        config_path: config::resolve_config_path(cli.config.as_ref()),
        compose_file_overrides: cli.compose_file.clone(),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Classify { teardown, project } => handle_classify(&ctx, teardown, project),
        Commands::Services => handle_services(&ctx),
        Commands::Check { services } => handle_check(&ctx, services),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details().cloned(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn read_config(ctx: &Context) -> Result<Config, HarnessError> {
    let mut cfg = config::load_config(&ctx.config_path)?;
    cfg.docker.compose_files.extend(
        ctx.compose_file_overrides
            .iter()
            .map(|path| path.to_string_lossy().to_string()),
    );
    config::validate_config(&cfg)?;
    Ok(cfg)
}

fn handle_classify(ctx: &Context, teardown: bool, project: Option<String>) -> Result<(), HarnessError> {
    let project = match project {
        Some(project) => project,
        None => read_config(ctx)?.docker.project_name,
    };
    let classifier = OutputClassifier::new(project);
    let mut events = Vec::new();
    for line in io::stdin().lock().lines() {
        let line = line?;
        let event = if teardown {
            serde_json::to_value(classifier.classify_teardown(&line))?
        } else {
            serde_json::to_value(classifier.classify(&line))?
        };
        if ctx.json {
            events.push(event);
        } else {
            println!("{event}");
        }
    }
    if ctx.json {
        output(ctx, json!({ "events": events }))?;
    }
    Ok(())
}

fn handle_services(ctx: &Context) -> Result<(), HarnessError> {
    let cfg = read_config(ctx)?;
    let engine = Engine::from_config(&cfg)?;
    let services = engine.declared_services()?;
    output(ctx, json!({ "project": engine.project(), "services": services }))
}

fn handle_check(ctx: &Context, services: Vec<String>) -> Result<(), HarnessError> {
    let cfg = read_config(ctx)?;
    let orchestration = Orchestration::from_config(cfg)?;
    orchestration.start()?;
    let synced = sync_services(&orchestration, &services);
    let stopped = orchestration.stop();
    let synced = synced?;
    stopped?;
    output(ctx, json!({ "synced": synced }))
}

/// Lines observed per service before its barrier.
fn sync_services(orchestration: &Orchestration, requested: &[String]) -> Result<BTreeMap<String, usize>, HarnessError> {
    let services: Vec<String> = if requested.is_empty() {
        orchestration.services()?.to_vec()
    } else {
        requested.to_vec()
    };
    let mut synced = BTreeMap::new();
    for service in services {
        match orchestration.sync(&service) {
            Ok(lines) => {
                info!(service = %service, lines = lines.len(), "sync barrier passed");
                synced.insert(service, lines.len());
            }
            Err(err) if requested.is_empty() => {
                // not every service answers sync requests
                warn!(service = %service, error = %err, "service skipped");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(synced)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), HarnessError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            read_config(ctx)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = read_config(ctx)?;
            if ctx.json {
                output(ctx, serde_json::to_value(&cfg)?)
            } else {
                print!("{}", serde_yaml::to_string(&cfg)?);
                Ok(())
            }
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), HarnessError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), HarnessError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
