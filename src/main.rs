use canopy::authz::engine;
use canopy::authz::loader;
use canopy::authz::types::{Decision, EntityUid};
use canopy::errors::CanopyError;
use canopy::settings::Settings;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "canopy",
    version,
    about = "Entity hierarchy store and policy decision service"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP decision service (default)
    Serve,
    /// Load the configured entities and policies and report what was loaded
    Validate,
    /// Evaluate one request against the configured files and print the decision
    Authorize {
        /// e.g. User::"alice" or User/alice
        #[arg(long)]
        principal: String,
        /// e.g. GetList or Action::"GetList"
        #[arg(long)]
        action: String,
        #[arg(long)]
        resource: String,
        /// JSON object
        #[arg(long)]
        context: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging; stdout is reserved for command output
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => canopy::web::serve(settings).await?,
        Commands::Validate => validate(&settings)?,
        Commands::Authorize {
            principal,
            action,
            resource,
            context,
        } => {
            let decision = authorize(&settings, &principal, &action, &resource, context.as_deref())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&decision).into_diagnostic()?
            );
        }
    }
    Ok(())
}

fn validate(settings: &Settings) -> Result<(), CanopyError> {
    let state = loader::load_state(&settings.data.entities_path, &settings.data.policies_dir)?;
    state.hierarchy.warm();
    println!(
        "entities: {}\npolicies: {}",
        state.entities.len(),
        state.policies.len()
    );
    Ok(())
}

fn authorize(
    settings: &Settings,
    principal: &str,
    action: &str,
    resource: &str,
    context: Option<&str>,
) -> Result<Decision, CanopyError> {
    let principal = EntityUid::parse(principal)
        .ok_or_else(|| CanopyError::BadRequest(format!("invalid principal `{principal}`")))?;
    let action = EntityUid::parse_action(action)
        .ok_or_else(|| CanopyError::BadRequest(format!("invalid action `{action}`")))?;
    let resource = EntityUid::parse(resource)
        .ok_or_else(|| CanopyError::BadRequest(format!("invalid resource `{resource}`")))?;
    let context = match context {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::Value::Null,
    };

    let state = loader::load_state(&settings.data.entities_path, &settings.data.policies_dir)?;
    Ok(engine::authorize(&state, principal, action, resource, &context))
}
