pub mod postgres;
pub mod scope;
pub mod sql;
pub mod sqlite;
pub mod trait_def;

pub use postgres::PostgresStore;
pub use scope::{Recent, ScopeOrder, VisitCountFilter, VisitScope};
pub use sql::Dialect;
pub use sqlite::SqliteStore;
pub use trait_def::{StorageError, StorageResult, VisitStore};
