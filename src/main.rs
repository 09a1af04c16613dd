//! SchemaFlow ORM command line
//!
//! Loads entity declarations from a JSON file, declares every class before the
//! database is reachable, then connects and lets each class reconcile its table.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use schemaflow_orm::config::Settings;
use schemaflow_orm::declaration::load_declarations;
use schemaflow_orm::{CommandBuilder, Orm, PgCommandBuilder, PgConnection, Schema};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "schemaflow-orm")]
#[command(about = "Declare entities and automigrate them against PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a declaration file and print the tables it describes
    Check {
        file: PathBuf,
        /// Print the CREATE TABLE statement for each entity
        #[arg(long)]
        sql: bool,
        #[arg(long, default_value = "public")]
        namespace: String,
    },
    /// Declare every entity, connect, and create missing tables
    Migrate {
        file: PathBuf,
        /// Seconds to wait for each class to finish preparing
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Check {
            file,
            sql,
            namespace,
        } => check(&file, sql, &namespace),
        Command::Migrate { file, timeout } => migrate(&file, Duration::from_secs(timeout)).await,
    }
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_orm=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

fn check(file: &Path, sql: bool, namespace: &str) -> Result<()> {
    let declarations = load_declarations(file)
        .with_context(|| format!("Failed to load declarations from {}", file.display()))?;

    for declaration in declarations {
        let schema = Arc::new(Schema::new(&declaration.name, declaration.schema));
        println!(
            "{} -> {}.{} (key: {})",
            schema.name(),
            namespace,
            schema.table(),
            schema.primary_keys().join(", ")
        );
        if sql {
            let builder = PgCommandBuilder::new(schema, namespace);
            println!("{};\n", builder.create_table().statement);
        }
    }
    Ok(())
}

async fn migrate(file: &Path, timeout: Duration) -> Result<()> {
    let declarations = load_declarations(file)
        .with_context(|| format!("Failed to load declarations from {}", file.display()))?;

    let settings = Settings::load()?;
    info!("Configuration loaded (schema {})", settings.database.namespace);

    // Declare first: every class waits on the ready channel until the pool is up.
    let orm = Orm::postgres(&settings.database.namespace);
    let preparations: Vec<_> = declarations
        .into_iter()
        .map(|declaration| {
            let class = orm.define(&declaration.name, declaration.schema);
            (declaration.name, class.prepare())
        })
        .collect();

    let connection = PgConnection::connect(&settings.database)
        .await
        .context("Failed to connect to the database")?;
    orm.connect_ready(connection);

    let mut failed = 0;
    for (name, preparation) in preparations {
        match tokio::time::timeout(timeout, preparation).await {
            Ok(Ok(class)) => info!("{}: ready (table {})", name, class.schema().table()),
            Ok(Err(e)) => {
                error!("{}: preparation failed: {}", name, e);
                failed += 1;
            }
            Err(_) => {
                error!("{}: not ready after {:?}", name, timeout);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} class(es) failed to prepare", failed, orm.models().len()));
    }
    info!("All {} class(es) ready", orm.models().len());
    Ok(())
}
