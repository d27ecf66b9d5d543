use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facescan_core::DetectorError;
use facescan_registry::{Config, Identity, Registry, RegistryError, VerifyOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facescan", version, about = "Face enrollment and verification")]
struct Cli {
    /// Database file (overrides config and FACESCAN_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Match tolerance in (0, 1]; higher accepts weaker matches
    #[arg(long, global = true)]
    tolerance: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in an image under a name
    Enroll {
        /// Display name for the new identity
        #[arg(short, long)]
        name: String,
        /// Image containing one face
        image: PathBuf,
    },
    /// Verify the face in an image against enrolled identities
    Verify {
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Print detected face regions
    Detect {
        image: PathBuf,
    },
    /// Show configuration and enrollment count
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = resolve_config(cli.db, cli.tolerance, |key| std::env::var(key).ok())?;
    let response = run(cli.command, &config)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// File and environment settings, then command-line flags, validated once.
fn resolve_config(
    db: Option<PathBuf>,
    tolerance: Option<f64>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut config = Config::resolve_from(lookup).context("loading configuration")?;
    if let Some(db) = db {
        config.db_path = db;
    }
    if let Some(tolerance) = tolerance {
        config.tolerance = tolerance;
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn run(command: Commands, config: &Config) -> Result<Value> {
    let mut registry = Registry::from_config(config).context("opening face registry")?;

    match command {
        Commands::Enroll { name, image } => {
            let bytes = read_image(&image)?;
            match registry.enroll(&bytes, &name) {
                Ok(identity) => Ok(json!({
                    "success": true,
                    "message": format!("user {} enrolled", identity.name),
                    "user": user_json(&identity),
                })),
                Err(e) => rejection(e),
            }
        }
        Commands::Verify { image } => {
            let bytes = read_image(&image)?;
            match registry.verify(&bytes) {
                Ok(VerifyOutcome::Authenticated { identity, confidence }) => Ok(json!({
                    "success": true,
                    "authenticated": true,
                    "message": format!("welcome, {}", identity.name),
                    "user": user_json(&identity),
                    "confidence": confidence,
                })),
                Ok(VerifyOutcome::NotRecognized) => Ok(json!({
                    "success": true,
                    "authenticated": false,
                    "message": "face not recognized",
                })),
                Err(e) => rejection(e),
            }
        }
        Commands::List => {
            let users: Vec<Value> = registry.list()?.iter().map(user_json).collect();
            Ok(json!({
                "success": true,
                "message": format!("{} enrolled", users.len()),
                "users": users,
            }))
        }
        Commands::Remove { id } => match registry.remove(&id) {
            Ok(identity) => Ok(json!({
                "success": true,
                "message": format!("user {} removed", identity.name),
                "user": user_json(&identity),
            })),
            Err(e) => rejection(e),
        },
        Commands::Detect { image } => {
            let bytes = read_image(&image)?;
            match registry.detector().detect(&bytes) {
                Ok(faces) => Ok(json!({
                    "success": true,
                    "message": format!("{} face(s) detected", faces.len()),
                    "faces": faces,
                })),
                Err(e @ DetectorError::DecodeFailure(_)) => Ok(json!({
                    "success": false,
                    "message": e.to_string(),
                })),
                Err(e) => Err(e.into()),
            }
        }
        Commands::Status => {
            let cascade = registry.detector().cascade();
            Ok(json!({
                "success": true,
                "message": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "database": config.db_path.display().to_string(),
                "cascade": {
                    "name": cascade.name,
                    "stages": cascade.stages.len(),
                },
                "tolerance": registry.tolerance(),
                "enrolled": registry.count()?,
            }))
        }
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

fn user_json(identity: &Identity) -> Value {
    json!({
        "id": identity.id,
        "name": identity.name,
        "added": identity.added(),
    })
}

/// Caller-facing failures become a `success: false` response; storage and
/// configuration failures propagate.
fn rejection(err: RegistryError) -> Result<Value> {
    match err {
        RegistryError::NameRequired
        | RegistryError::NoFaceDetected
        | RegistryError::DuplicateName(_)
        | RegistryError::NoEnrolledIdentities
        | RegistryError::IdentityNotFound(_) => Ok(json!({
            "success": false,
            "message": err.to_string(),
        })),
        other => Err(other.into()),
    }
}
