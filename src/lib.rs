pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod registry;
pub mod storage;
pub mod tracker;

pub use error::{VisitError, VisitResult};
pub use models::{EntityRef, Visit, VisitableCounters, VisitableRef, VisitorKey};
pub use registry::{Registry, VisitableOptions};
pub use storage::{VisitScope, VisitStore};
pub use tracker::{Identifier, Identifiers, VisitTracker};

use anyhow::Result;
use std::sync::Arc;

use config::{DatabaseBackend, DatabaseConfig};
use storage::{PostgresStore, SqliteStore};

/// Connect to the configured backend and make sure the schema exists.
pub async fn connect_store(
    database: &DatabaseConfig,
    extra_columns: Vec<String>,
) -> Result<Arc<dyn VisitStore>> {
    let store: Arc<dyn VisitStore> = match database.backend {
        DatabaseBackend::Sqlite => Arc::new(
            SqliteStore::new(&database.url, database.max_connections, extra_columns).await?,
        ),
        DatabaseBackend::Postgres => Arc::new(
            PostgresStore::new(&database.url, database.max_connections, extra_columns).await?,
        ),
    };
    store.init().await?;
    Ok(store)
}
