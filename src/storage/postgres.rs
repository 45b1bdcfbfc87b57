use crate::models::{NewVisit, Visit, VisitAttributes, VisitableCounters, VisitableRef};
use crate::storage::sql::{self, bind_scalar_values, bind_values, visit_from_row, Dialect};
use crate::storage::{StorageResult, VisitScope, VisitStore};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use std::sync::Arc;

const DIALECT: Dialect = Dialect::Postgres;

pub struct PostgresStore {
    pool: Arc<PgPool>,
    extra_columns: Vec<String>,
}

impl PostgresStore {
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        extra_columns: Vec<String>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
            extra_columns,
        })
    }
}

#[async_trait]
impl VisitStore for PostgresStore {
    async fn init(&self) -> Result<()> {
        for statement in sql::schema_statements(DIALECT, &self.extra_columns) {
            sqlx::query(&statement)
                .execute(self.pool.as_ref())
                .await?;
        }

        for column in &self.extra_columns {
            sqlx::query(&format!(
                "ALTER TABLE visits ADD COLUMN IF NOT EXISTS {column} TEXT"
            ))
            .execute(self.pool.as_ref())
            .await?;
        }

        Ok(())
    }

    async fn insert_visit(&self, visit: &NewVisit) -> StorageResult<Visit> {
        let now = chrono::Utc::now().timestamp();
        let (statement, values) = sql::insert_visit(&self.extra_columns, visit, now);

        let row = bind_values(sqlx::query::<Postgres>(&DIALECT.prepare(&statement)), values)
            .fetch_one(self.pool.as_ref())
            .await?;

        Ok(visit_from_row(&row, &self.extra_columns)?)
    }

    async fn increment_visit(
        &self,
        id: i64,
        attributes: &VisitAttributes,
    ) -> StorageResult<Option<Visit>> {
        let now = chrono::Utc::now().timestamp();
        let (statement, values) = sql::increment_visit(&self.extra_columns, id, attributes, now);

        let row = bind_values(sqlx::query::<Postgres>(&DIALECT.prepare(&statement)), values)
            .fetch_optional(self.pool.as_ref())
            .await?;

        match row {
            Some(row) => Ok(Some(visit_from_row(&row, &self.extra_columns)?)),
            None => Ok(None),
        }
    }

    async fn delete_all_for(&self, visitable: &VisitableRef) -> StorageResult<u64> {
        let result = sqlx::query(&DIALECT.prepare(sql::DELETE_VISITS_FOR))
            .bind(&visitable.type_tag)
            .bind(visitable.id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn sum_counts(&self, visitable: &VisitableRef) -> StorageResult<i64> {
        let total = sqlx::query_scalar::<_, i64>(&DIALECT.prepare(sql::SUM_COUNTS))
            .bind(&visitable.type_tag)
            .bind(visitable.id)
            .fetch_one(self.pool.as_ref())
            .await?;

        Ok(total)
    }

    async fn query(&self, scope: &VisitScope) -> StorageResult<Vec<Visit>> {
        let (scope_sql, values) = scope.to_sql();
        let statement = sql::select_visits(&self.extra_columns, &scope_sql);

        let rows = bind_values(sqlx::query::<Postgres>(&DIALECT.prepare(&statement)), values)
            .fetch_all(self.pool.as_ref())
            .await?;

        let visits = rows
            .iter()
            .map(|row| visit_from_row(row, &self.extra_columns))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(visits)
    }

    async fn count(&self, scope: &VisitScope) -> StorageResult<i64> {
        let (scope_sql, values) = scope.to_sql();
        let statement = sql::count_visits(&scope_sql);

        let statement = DIALECT.prepare(&statement);

        let count = bind_scalar_values(sqlx::query_scalar::<Postgres, i64>(&statement), values)
            .fetch_one(self.pool.as_ref())
            .await?;

        Ok(count)
    }

    async fn init_counters(&self, visitable: &VisitableRef) -> StorageResult<()> {
        sqlx::query(&DIALECT.prepare(sql::INIT_COUNTERS))
            .bind(&visitable.type_tag)
            .bind(visitable.id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn load_counters(
        &self,
        visitable: &VisitableRef,
    ) -> StorageResult<Option<VisitableCounters>> {
        let statement = DIALECT.prepare(sql::LOAD_COUNTERS);
        let row = sqlx::query_as::<_, (Option<i64>, Option<i64>)>(&statement)
            .bind(&visitable.type_tag)
            .bind(visitable.id)
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(match row {
            Some((Some(total_visits), Some(unique_visitors))) => Some(VisitableCounters {
                total_visits,
                unique_visitors,
            }),
            _ => None,
        })
    }

    async fn increment_counters(
        &self,
        visitable: &VisitableRef,
        total_delta: i64,
        unique_delta: i64,
    ) -> StorageResult<bool> {
        let result = sqlx::query(&DIALECT.prepare(sql::INCREMENT_COUNTERS))
            .bind(total_delta)
            .bind(unique_delta)
            .bind(&visitable.type_tag)
            .bind(visitable.id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn write_counters(
        &self,
        visitable: &VisitableRef,
        counters: VisitableCounters,
    ) -> StorageResult<()> {
        sqlx::query(&DIALECT.prepare(sql::WRITE_COUNTERS))
            .bind(&visitable.type_tag)
            .bind(visitable.id)
            .bind(counters.total_visits)
            .bind(counters.unique_visitors)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }
}
