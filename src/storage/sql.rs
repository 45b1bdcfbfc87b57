//! SQL text shared by the SQLite and PostgreSQL backends
//!
//! Statements are written once with `?` placeholders and rewritten to `$n`
//! for PostgreSQL. Row decoding and argument binding are generic over the
//! sqlx driver.

use sqlx::{ColumnIndex, Database, Decode, Encode, Row, Type};

use crate::models::{EntityRef, NewVisit, Visit, VisitAttributes, VisitableRef, VisitorKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Rewrite `?` placeholders into the dialect's positional form.
    pub fn prepare(self, sql: &str) -> String {
        match self {
            Dialect::Sqlite => sql.to_string(),
            Dialect::Postgres => {
                let mut out = String::with_capacity(sql.len() + 16);
                let mut position = 0;
                for ch in sql.chars() {
                    if ch == '?' {
                        position += 1;
                        out.push('$');
                        out.push_str(&position.to_string());
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "id BIGSERIAL PRIMARY KEY",
        }
    }

    fn integer(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER",
            Dialect::Postgres => "BIGINT",
        }
    }
}

/// A value bound to a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Int(i64),
    NullableInt(Option<i64>),
    Text(String),
    NullableText(Option<String>),
}

/// Bind `values` onto `query` in order.
pub fn bind_values<'q, DB>(
    mut query: sqlx::query::Query<'q, DB, <DB as Database>::Arguments<'q>>,
    values: Vec<SqlValue>,
) -> sqlx::query::Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    i64: Encode<'q, DB> + Type<DB>,
    String: Encode<'q, DB> + Type<DB>,
    Option<i64>: Encode<'q, DB> + Type<DB>,
    Option<String>: Encode<'q, DB> + Type<DB>,
{
    for value in values {
        query = match value {
            SqlValue::Int(v) => query.bind(v),
            SqlValue::NullableInt(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::NullableText(v) => query.bind(v),
        };
    }
    query
}

/// Same as `bind_values` for scalar queries.
pub fn bind_scalar_values<'q, DB, O>(
    mut query: sqlx::query::QueryScalar<'q, DB, O, <DB as Database>::Arguments<'q>>,
    values: Vec<SqlValue>,
) -> sqlx::query::QueryScalar<'q, DB, O, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    i64: Encode<'q, DB> + Type<DB>,
    String: Encode<'q, DB> + Type<DB>,
    Option<i64>: Encode<'q, DB> + Type<DB>,
    Option<String>: Encode<'q, DB> + Type<DB>,
{
    for value in values {
        query = match value {
            SqlValue::Int(v) => query.bind(v),
            SqlValue::NullableInt(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::NullableText(v) => query.bind(v),
        };
    }
    query
}

/// Statements creating the visits and counter tables with their indexes.
pub fn schema_statements(dialect: Dialect, extra_columns: &[String]) -> Vec<String> {
    let int = dialect.integer();
    let extras: String = extra_columns
        .iter()
        .map(|column| format!(",\n    {column} TEXT"))
        .collect();

    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS visits (
    {id},
    visitable_id {int} NOT NULL,
    visitable_type VARCHAR(255) NOT NULL,
    visitor_id {int},
    visitor_type VARCHAR(255),
    ip VARCHAR(24),
    visits {int} NOT NULL DEFAULT 1,
    created_at {int} NOT NULL,
    updated_at {int} NOT NULL{extras}
)"#,
            id = dialect.id_column(),
        ),
        "CREATE INDEX IF NOT EXISTS index_visits_on_visitor_id_and_visitor_type \
         ON visits (visitor_id, visitor_type)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS index_visits_on_visitable_id_and_visitable_type \
         ON visits (visitable_id, visitable_type)"
            .to_string(),
        // One row per (visitable, visitor-or-ip) pairing. NULLs never collide in a
        // unique index, so the nullable halves are folded to sentinels.
        "CREATE UNIQUE INDEX IF NOT EXISTS index_visits_on_pairing ON visits (\
         visitable_type, visitable_id, (COALESCE(visitor_type, '')), \
         (COALESCE(visitor_id, 0)), (COALESCE(ip, '')))"
            .to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS visitable_counters (
    visitable_type VARCHAR(255) NOT NULL,
    visitable_id {int} NOT NULL,
    cached_total_visits {int},
    cached_unique_visits {int},
    PRIMARY KEY (visitable_type, visitable_id)
)"#
        ),
    ]
}

const BASE_COLUMNS: &str =
    "id, visitable_id, visitable_type, visitor_id, visitor_type, ip, visits, created_at, updated_at";

/// Column list for `SELECT`/`RETURNING`, including extra attribute columns.
pub fn visit_columns(extra_columns: &[String]) -> String {
    let mut columns = BASE_COLUMNS.to_string();
    for column in extra_columns {
        columns.push_str(", ");
        columns.push_str(column);
    }
    columns
}

pub fn select_visits(extra_columns: &[String], scope_sql: &str) -> String {
    format!(
        "SELECT {} FROM visits {}",
        visit_columns(extra_columns),
        scope_sql
    )
}

pub fn count_visits(scope_sql: &str) -> String {
    format!("SELECT COUNT(*) FROM (SELECT id FROM visits {scope_sql}) AS scoped")
}

pub const SUM_COUNTS: &str = "SELECT CAST(COALESCE(SUM(visits), 0) AS BIGINT) FROM visits \
     WHERE visitable_type = ? AND visitable_id = ?";

pub const DELETE_VISITS_FOR: &str =
    "DELETE FROM visits WHERE visitable_type = ? AND visitable_id = ?";

pub const INIT_COUNTERS: &str = r#"
    INSERT INTO visitable_counters (visitable_type, visitable_id, cached_total_visits, cached_unique_visits)
    VALUES (?, ?, 0, 0)
    ON CONFLICT (visitable_type, visitable_id) DO UPDATE SET
        cached_total_visits = COALESCE(visitable_counters.cached_total_visits, 0),
        cached_unique_visits = COALESCE(visitable_counters.cached_unique_visits, 0)
"#;

pub const LOAD_COUNTERS: &str = r#"
    SELECT cached_total_visits, cached_unique_visits
    FROM visitable_counters
    WHERE visitable_type = ? AND visitable_id = ?
"#;

pub const INCREMENT_COUNTERS: &str = r#"
    UPDATE visitable_counters
    SET cached_total_visits = cached_total_visits + ?,
        cached_unique_visits = cached_unique_visits + ?
    WHERE visitable_type = ? AND visitable_id = ?
      AND cached_total_visits IS NOT NULL
      AND cached_unique_visits IS NOT NULL
"#;

pub const WRITE_COUNTERS: &str = r#"
    INSERT INTO visitable_counters (visitable_type, visitable_id, cached_total_visits, cached_unique_visits)
    VALUES (?, ?, ?, ?)
    ON CONFLICT (visitable_type, visitable_id) DO UPDATE SET
        cached_total_visits = excluded.cached_total_visits,
        cached_unique_visits = excluded.cached_unique_visits
"#;

/// `INSERT ... RETURNING` for a new pairing row.
pub fn insert_visit(
    extra_columns: &[String],
    visit: &NewVisit,
    now: i64,
) -> (String, Vec<SqlValue>) {
    let (visitor_id, visitor_type, ip) = visitor_columns(&visit.visitor);

    let mut columns = vec![
        "visitable_id",
        "visitable_type",
        "visitor_id",
        "visitor_type",
        "ip",
        "visits",
        "created_at",
        "updated_at",
    ];
    let mut values = vec![
        SqlValue::Int(visit.visitable.id),
        SqlValue::Text(visit.visitable.type_tag.clone()),
        SqlValue::NullableInt(visitor_id),
        SqlValue::NullableText(visitor_type),
        SqlValue::NullableText(ip),
        SqlValue::Int(visit.count),
        SqlValue::Int(now),
        SqlValue::Int(now),
    ];

    for (name, value) in declared(extra_columns, &visit.attributes) {
        columns.push(name);
        values.push(SqlValue::Text(value.clone()));
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO visits ({}) VALUES ({}) RETURNING {}",
        columns.join(", "),
        placeholders,
        visit_columns(extra_columns)
    );
    (sql, values)
}

/// `UPDATE ... RETURNING` bumping an existing row by one and applying attributes.
pub fn increment_visit(
    extra_columns: &[String],
    id: i64,
    attributes: &VisitAttributes,
    now: i64,
) -> (String, Vec<SqlValue>) {
    let mut assignments = vec!["visits = visits + 1".to_string(), "updated_at = ?".to_string()];
    let mut values = vec![SqlValue::Int(now)];

    for (name, value) in declared(extra_columns, attributes) {
        assignments.push(format!("{name} = ?"));
        values.push(SqlValue::Text(value.clone()));
    }
    values.push(SqlValue::Int(id));

    let sql = format!(
        "UPDATE visits SET {} WHERE id = ? RETURNING {}",
        assignments.join(", "),
        visit_columns(extra_columns)
    );
    (sql, values)
}

/// Attributes whose name is one of the table's extra columns, in column order.
fn declared<'a>(
    extra_columns: &'a [String],
    attributes: &'a VisitAttributes,
) -> impl Iterator<Item = (&'a str, &'a String)> {
    extra_columns
        .iter()
        .filter_map(move |column| attributes.get(column).map(|value| (column.as_str(), value)))
}

fn visitor_columns(visitor: &VisitorKey) -> (Option<i64>, Option<String>, Option<String>) {
    match visitor {
        VisitorKey::Identified { entity } => (Some(entity.id), Some(entity.type_tag.clone()), None),
        VisitorKey::Anonymous { ip } => (None, None, Some(ip.clone())),
    }
}

/// Decode one visits row.
pub fn visit_from_row<'r, R>(row: &'r R, extra_columns: &[String]) -> Result<Visit, sqlx::Error>
where
    R: Row,
    for<'c> &'c str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
    Option<i64>: Decode<'r, R::Database> + Type<R::Database>,
    Option<String>: Decode<'r, R::Database> + Type<R::Database>,
{
    let visitor_id: Option<i64> = row.try_get("visitor_id")?;
    let visitor_type: Option<String> = row.try_get("visitor_type")?;
    let ip: Option<String> = row.try_get("ip")?;

    let visitor = match (visitor_type, visitor_id, ip) {
        (Some(type_tag), Some(id), _) => VisitorKey::identified(EntityRef::new(type_tag, id)),
        (_, _, Some(ip)) => VisitorKey::anonymous(ip),
        _ => {
            return Err(sqlx::Error::Decode(
                "visit row has neither a visitor nor an ip".into(),
            ))
        }
    };

    let mut attributes = VisitAttributes::new();
    for column in extra_columns {
        let value: Option<String> = row.try_get(column.as_str())?;
        if let Some(value) = value {
            attributes.insert(column.clone(), value);
        }
    }

    Ok(Visit {
        id: row.try_get("id")?,
        visitable: VisitableRef::new(
            row.try_get::<String, _>("visitable_type")?,
            row.try_get("visitable_id")?,
        ),
        visitor,
        count: row.try_get("visits")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        attributes,
    })
}
