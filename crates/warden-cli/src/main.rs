use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warden_agents::{builtin_agents, AgentRegistry};
use warden_core::{
    ExecutionContext, Generation, GenerationBackend, GenerationRequest, WardenError, WardenResult,
};
use warden_orchestrator::{TemplateSpec, WardenConfig, WorkflowTemplate};
use warden_security::{Strictness, Validator};

#[derive(Parser)]
#[command(name = "warden", about = "Warden: agent orchestration and workflow engine")]
struct Cli {
    /// Path to config file; ./warden.toml is used when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Validate a workflow template file (JSON) and print its execution order
    Validate {
        template: PathBuf,
    },
    /// List the built-in agents and their effective settings
    Agents,
    /// Redact credentials from text read from a file or stdin
    Sanitize {
        /// Input file; stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Also print the input validation report at this strictness
        #[arg(long)]
        report: Option<Strictness>,
    },
}

const DEFAULT_CONFIG: &str = "warden.toml";

/// Stands in for a provider when agents are only listed, never run.
struct OfflineBackend;

#[async_trait]
impl GenerationBackend for OfflineBackend {
    async fn generate(&self, _request: GenerationRequest) -> WardenResult<Generation> {
        Err(WardenError::ProviderUnavailable(
            "no generation provider configured".into(),
        ))
    }
}

/// Missing default config file means defaults; an explicit path must exist.
fn load_config(path: &Path, explicit: bool) -> anyhow::Result<WardenConfig> {
    if !explicit && !path.exists() {
        info!(path = %path.display(), "No config file, using defaults");
        return Ok(WardenConfig::default());
    }
    WardenConfig::load(path)
        .with_context(|| format!("Failed to load config file '{}'", path.display()))
}

fn check_template(raw: &str) -> anyhow::Result<WorkflowTemplate> {
    let spec: TemplateSpec = serde_json::from_str(raw).context("Template is not valid JSON")?;
    Ok(WorkflowTemplate::from_spec(spec)?)
}

fn build_registry(config: &WardenConfig) -> anyhow::Result<AgentRegistry> {
    let registry = AgentRegistry::with_agents(builtin_agents(Arc::new(OfflineBackend)))?;
    let applied = config.apply_agent_overrides(&registry);
    info!(overrides = applied, "Agent overrides applied");
    Ok(registry)
}

fn read_input(file: Option<&Path>) -> anyhow::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read '{}'", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => load_config(path, true)?,
        None => load_config(Path::new(DEFAULT_CONFIG), false)?,
    };

    match cli.command {
        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Validate { template } => {
            let raw = std::fs::read_to_string(&template)
                .with_context(|| format!("Failed to read '{}'", template.display()))?;
            let template = check_template(&raw)?;
            println!(
                "Template '{}' v{} is valid ({} steps)",
                template.name,
                template.version,
                template.steps.len()
            );
            for (i, step_id) in template.order.iter().enumerate() {
                let Some(step) = template.step(step_id) else {
                    continue;
                };
                let deps = if step.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" after {}", step.depends_on.join(", "))
                };
                let optional = if step.optional { " (optional)" } else { "" };
                println!("  {}. {step_id} → {}{deps}{optional}", i + 1, step.agent);
            }
        }
        Commands::Agents => {
            let registry = build_registry(&config)?;
            println!("Registered agents:");
            for handle in registry.all() {
                let d = handle.descriptor();
                let alias = d
                    .legacy_alias
                    .as_deref()
                    .map(|a| format!(" (alias: {a})"))
                    .unwrap_or_default();
                let enabled = if d.enabled_by_default { "" } else { " [disabled by default]" };
                println!("  {} v{} [{}] priority {}{alias}{enabled}", d.name, d.version, d.category, d.priority);
                if let Some(t) = handle.settings.temperature {
                    println!("    temperature: {t}");
                }
                if let Some(m) = handle.settings.max_tokens {
                    println!("    max_tokens: {m}");
                }
            }
            println!("\nTotal: {} agent(s)", registry.len());
        }
        Commands::Sanitize { file, report } => {
            let input = read_input(file.as_deref())?;
            let strictness = report.unwrap_or(config.validator.strictness);
            let validator = Validator::new(strictness);
            let (redacted, hits) = validator.sanitizer().redact_counting(&input);
            print!("{redacted}");
            info!(redactions = hits, "Input sanitized");
            if report.is_some() {
                let ctx = ExecutionContext::default().with_input_text(input);
                let report = validator.validate_input(&ctx);
                eprintln!("{}", serde_json::to_string_pretty(&report)?);
                if !report.is_valid() {
                    anyhow::bail!("Input rejected at {strictness:?} strictness");
                }
            }
        }
    }

    Ok(())
}
