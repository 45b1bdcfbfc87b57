use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use visitrack::config::{Config, DatabaseBackend};
use visitrack::storage::{sql, Dialect};
use visitrack::{connect_store, EntityRef, Identifiers, Registry, VisitTracker};

#[derive(Parser)]
#[command(name = "visitrack-admin")]
#[command(about = "Visit tracking admin CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the DDL for the configured backend
    Schema,
    /// Show visit totals for a visitable
    Stats {
        /// Visitable type, e.g. post
        visitable_type: String,
        visitable_id: i64,
        /// Recompute from the visit log instead of reading cached counters
        #[arg(long)]
        force: bool,
    },
    /// Recompute and store cached counters
    Recount {
        visitable_type: String,
        visitable_id: i64,
    },
    /// Delete every visit of a visitable
    Reset {
        visitable_type: String,
        visitable_id: i64,
    },
    /// Record a visit by hand
    Visit {
        visitable_type: String,
        visitable_id: i64,
        /// Visitor entity as type:id, e.g. user:3
        #[arg(long, conflicts_with = "ip")]
        by: Option<String>,
        /// Anonymous visitor IP
        #[arg(long)]
        ip: Option<String>,
    },
}

fn parse_entity(raw: &str) -> Result<EntityRef> {
    let Some((type_tag, id)) = raw.split_once(':') else {
        bail!("visitor '{raw}' must look like type:id");
    };
    let id = id
        .parse::<i64>()
        .with_context(|| format!("visitor id in '{raw}' is not an integer"))?;
    Ok(EntityRef::new(type_tag, id))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let registry = Arc::new(Registry::from_definition(config.registry.clone())?);

    if let Commands::Schema = cli.command {
        let dialect = match config.database.backend {
            DatabaseBackend::Sqlite => Dialect::Sqlite,
            DatabaseBackend::Postgres => Dialect::Postgres,
        };
        for statement in sql::schema_statements(dialect, &registry.extra_columns()) {
            println!("{statement};\n");
        }
        return Ok(());
    }

    let store = connect_store(&config.database, registry.extra_columns()).await?;
    let tracker = VisitTracker::new(store, registry);

    match cli.command {
        Commands::Schema => {}
        Commands::Stats {
            visitable_type,
            visitable_id,
            force,
        } => {
            let visitable = tracker.visitable(EntityRef::new(visitable_type, visitable_id))?;
            let total = visitable.total_visits(force).await?;
            let unique = visitable.unique_visits(force).await?;
            println!("{}", visitable.entity());
            println!("  total visits:    {total}");
            println!("  unique visitors: {unique}");
        }
        Commands::Recount {
            visitable_type,
            visitable_id,
        } => {
            let visitable = tracker.visitable(EntityRef::new(visitable_type, visitable_id))?;
            let counters = visitable.recount().await?;
            println!(
                "✓ {} now has {} visits from {} visitors",
                visitable.entity(),
                counters.total_visits,
                counters.unique_visitors
            );
        }
        Commands::Reset {
            visitable_type,
            visitable_id,
        } => {
            let visitable = tracker.visitable(EntityRef::new(visitable_type, visitable_id))?;
            visitable.reset_visits().await?;
            println!("✓ Reset visits of {}", visitable.entity());
        }
        Commands::Visit {
            visitable_type,
            visitable_id,
            by,
            ip,
        } => {
            let identifiers = match (by, ip) {
                (Some(by), _) => Identifiers::by(parse_entity(&by)?),
                (None, Some(ip)) => Identifiers::ip(ip),
                (None, None) => bail!("either --by or --ip is required"),
            };
            let visitable = tracker.visitable(EntityRef::new(visitable_type, visitable_id))?;
            let visit = visitable.visit(&identifiers).await?;
            println!(
                "✓ {} visited {} ({} visits)",
                visit.visitor, visit.visitable, visit.count
            );
        }
    }

    Ok(())
}
