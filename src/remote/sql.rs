//! Pooled SQL sessions for MySQL and PostgreSQL.
//!
//! # Connection settings
//!
//! Options are built field by field from the target and credentials. The
//! equivalent DSN, shown (password masked) in logs, has a fixed field order
//! per backend:
//!
//! | Backend | DSN |
//! |---------|-----|
//! | MySQL | `user:password@tcp(host:port)/database` |
//! | PostgreSQL | `host=H port=P user=U password=W dbname=D sslmode=disable` |
//!
//! TLS is disabled for both backends.
//!
//! # Pool bounds
//!
//! - max connection lifetime: the invocation timeout (0 means unlimited)
//! - max open connections: [`SQL_MAX_OPEN_CONNECTIONS`]
//! - idle connections never exceed the open cap, so the idle cap of
//!   [`SQL_MAX_IDLE_CONNECTIONS`] holds without extra bookkeeping
//!
//! The pool is lazy: nothing is dialed until the first query, which is where
//! unreachable servers and bad passwords surface.
//!
//! # Queries
//!
//! Queries run through the text protocol (`raw_sql`), so every value arrives
//! as text and is kept verbatim; SQL `NULL` becomes `None`.
//! The header rule under the column names is sized in characters, not
//! bytes (see [`crate::remote::render`]).

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Executor, Row};
use tracing::{debug, info};

use super::config::{SQL_MAX_IDLE_CONNECTIONS, SQL_MAX_OPEN_CONNECTIONS};
use super::credentials::Credentials;
use super::error::{ConnectionError, ExecutionError};
use super::session::Session;
use super::types::{Operation, OperationResult, Protocol, TabularResult, Target};

/// Shown instead of a nonempty password.
const PASSWORD_MASK: &str = "****";

enum SqlPool {
    MySql(MySqlPool),
    Postgres(PgPool),
}

/// A lazily connected SQL pool.
pub struct SqlSession {
    pool: Option<SqlPool>,
    protocol: Protocol,
    dsn: String,
}

impl SqlSession {
    /// Build the pool for `target`. No connection is attempted.
    pub fn open(
        target: &Target,
        database: &str,
        credentials: &Credentials,
        lifetime: Duration,
    ) -> Result<Self, ConnectionError> {
        validate_fields(&target.host, &credentials.username, database)?;

        let protocol = target.protocol();
        let dsn = render_dsn(protocol, target, database, credentials)?;
        let max_lifetime = (!lifetime.is_zero()).then_some(lifetime);
        let password = credentials.password_or_empty();

        let pool = match protocol {
            Protocol::MySql => {
                let options = MySqlConnectOptions::new()
                    .host(&target.host)
                    .port(target.port)
                    .username(&credentials.username)
                    .password(password)
                    .database(database)
                    .ssl_mode(MySqlSslMode::Disabled);

                SqlPool::MySql(
                    MySqlPoolOptions::new()
                        .max_connections(SQL_MAX_OPEN_CONNECTIONS)
                        .min_connections(0)
                        .max_lifetime(max_lifetime)
                        .idle_timeout(None::<Duration>)
                        .connect_lazy_with(options),
                )
            }
            Protocol::Postgres => {
                let mut options = PgConnectOptions::new()
                    .host(&target.host)
                    .port(target.port)
                    .username(&credentials.username)
                    .database(database)
                    .ssl_mode(PgSslMode::Disable);
                if !password.is_empty() {
                    options = options.password(password);
                }

                SqlPool::Postgres(
                    PgPoolOptions::new()
                        .max_connections(SQL_MAX_OPEN_CONNECTIONS)
                        .min_connections(0)
                        .max_lifetime(max_lifetime)
                        .idle_timeout(None::<Duration>)
                        .connect_lazy_with(options),
                )
            }
            other => {
                return Err(ConnectionError::DsnInvalid(format!(
                    "{} is not a SQL protocol",
                    other
                )));
            }
        };

        info!(
            "Opened {} pool ({} open / {} idle max, lifetime {:?}): {}",
            protocol, SQL_MAX_OPEN_CONNECTIONS, SQL_MAX_IDLE_CONNECTIONS, max_lifetime, dsn
        );

        Ok(Self {
            pool: Some(pool),
            protocol,
            dsn,
        })
    }

    /// Connection string with the password masked.
    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

#[async_trait]
impl Session for SqlSession {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn execute(
        &mut self,
        operation: &Operation,
        _input: Option<&[u8]>,
    ) -> Result<OperationResult, ExecutionError> {
        let sql = operation.as_str();
        let table = match &self.pool {
            Some(SqlPool::MySql(pool)) => {
                let rows = sqlx::raw_sql(sql)
                    .fetch_all(pool)
                    .await
                    .map_err(|e| ExecutionError::QueryFailed(e.to_string()))?;
                let mut table = tabulate(&rows)?;
                if rows.is_empty() {
                    table.columns = match pool.describe(sql).await {
                        Ok(described) => column_names(described.columns()),
                        Err(e) => {
                            debug!("Could not describe statement columns: {}", e);
                            Vec::new()
                        }
                    };
                }
                table
            }
            Some(SqlPool::Postgres(pool)) => {
                let rows = sqlx::raw_sql(sql)
                    .fetch_all(pool)
                    .await
                    .map_err(|e| ExecutionError::QueryFailed(e.to_string()))?;
                let mut table = tabulate(&rows)?;
                if rows.is_empty() {
                    table.columns = match pool.describe(sql).await {
                        Ok(described) => column_names(described.columns()),
                        Err(e) => {
                            debug!("Could not describe statement columns: {}", e);
                            Vec::new()
                        }
                    };
                }
                table
            }
            None => {
                return Err(ExecutionError::QueryFailed("session is closed".to_string()));
            }
        };

        debug!(
            "Query returned {} column(s), {} row(s)",
            table.columns.len(),
            table.rows.len()
        );
        Ok(OperationResult::Tabular(table))
    }

    async fn close(&mut self) {
        match self.pool.take() {
            Some(SqlPool::MySql(pool)) => pool.close().await,
            Some(SqlPool::Postgres(pool)) => pool.close().await,
            None => {}
        }
    }
}

/// A result row read through the text protocol.
trait TextRow {
    fn column_names(&self) -> Vec<String>;
    fn width(&self) -> usize;
    /// Cell `index` verbatim; `None` for SQL `NULL`.
    fn text(&self, index: usize) -> Result<Option<String>, String>;
}

impl TextRow for MySqlRow {
    fn column_names(&self) -> Vec<String> {
        column_names(self.columns())
    }

    fn width(&self) -> usize {
        self.len()
    }

    fn text(&self, index: usize) -> Result<Option<String>, String> {
        self.try_get_unchecked(index).map_err(|e| e.to_string())
    }
}

impl TextRow for PgRow {
    fn column_names(&self) -> Vec<String> {
        column_names(self.columns())
    }

    fn width(&self) -> usize {
        self.len()
    }

    fn text(&self, index: usize) -> Result<Option<String>, String> {
        self.try_get_unchecked(index).map_err(|e| e.to_string())
    }
}

fn column_names<C: Column>(columns: &[C]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

/// Convert text-protocol rows into a table, columns taken from the first row.
fn tabulate<R: TextRow>(rows: &[R]) -> Result<TabularResult, ExecutionError> {
    let columns = rows.first().map(TextRow::column_names).unwrap_or_default();

    let mut table_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = (0..row.width())
            .map(|index| row.text(index))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ExecutionError::QueryFailed)?;
        table_rows.push(cells);
    }

    Ok(TabularResult {
        columns,
        rows: table_rows,
    })
}

/// Reject settings that cannot form a well-defined DSN.
fn validate_fields(host: &str, username: &str, database: &str) -> Result<(), ConnectionError> {
    if host.is_empty() {
        return Err(ConnectionError::DsnInvalid("host is empty".to_string()));
    }
    if username.is_empty() {
        return Err(ConnectionError::DsnInvalid("username is empty".to_string()));
    }
    if host.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(ConnectionError::DsnInvalid(format!(
            "host '{}' contains whitespace or '/'",
            host
        )));
    }
    if database.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(ConnectionError::DsnInvalid(format!(
            "database name '{}' contains whitespace or '/'",
            database
        )));
    }
    Ok(())
}

/// Render the documented DSN for `protocol` with the password masked.
fn render_dsn(
    protocol: Protocol,
    target: &Target,
    database: &str,
    credentials: &Credentials,
) -> Result<String, ConnectionError> {
    let password = if credentials.password_or_empty().is_empty() {
        ""
    } else {
        PASSWORD_MASK
    };

    match protocol {
        Protocol::MySql => Ok(format!(
            "{}:{}@tcp({})/{}",
            credentials.username,
            password,
            target.address(),
            database
        )),
        Protocol::Postgres => Ok(format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable",
            target.host, target.port, credentials.username, password, database
        )),
        other => Err(ConnectionError::DsnInvalid(format!(
            "{} is not a SQL protocol",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::credentials::AuthMethod;
    use crate::remote::types::Backend;

    fn credentials(username: &str, password: &str) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: Some(password.to_string()),
            private_key: None,
            strategies: vec![AuthMethod::Password],
        }
    }

    fn mysql_target() -> Target {
        Target::new(
            "localhost",
            3306,
            Backend::MySql {
                database: "test".to_string(),
            },
        )
    }

    fn postgres_target() -> Target {
        Target::new(
            "db.internal",
            5432,
            Backend::Postgres {
                database: "postgres".to_string(),
            },
        )
    }

    mod dsn {
        use super::*;

        #[test]
        fn test_mysql_field_order() {
            let dsn = render_dsn(
                Protocol::MySql,
                &mysql_target(),
                "test",
                &credentials("root", ""),
            )
            .unwrap();
            assert_eq!(dsn, "root:@tcp(localhost:3306)/test");
        }

        #[test]
        fn test_mysql_masks_password() {
            let dsn = render_dsn(
                Protocol::MySql,
                &mysql_target(),
                "test",
                &credentials("root", "hunter2"),
            )
            .unwrap();
            assert_eq!(dsn, "root:****@tcp(localhost:3306)/test");
            assert!(!dsn.contains("hunter2"));
        }

        #[test]
        fn test_postgres_field_order() {
            let dsn = render_dsn(
                Protocol::Postgres,
                &postgres_target(),
                "postgres",
                &credentials("postgres", "pw"),
            )
            .unwrap();
            assert_eq!(
                dsn,
                "host=db.internal port=5432 user=postgres password=**** dbname=postgres sslmode=disable"
            );
        }

        #[test]
        fn test_dsn_is_stable() {
            let creds = credentials("root", "x");
            let first = render_dsn(Protocol::MySql, &mysql_target(), "test", &creds).unwrap();
            let second = render_dsn(Protocol::MySql, &mysql_target(), "test", &creds).unwrap();
            assert_eq!(first, second);
        }

        #[test]
        fn test_non_sql_protocol_rejected() {
            let target = Target::new("localhost", 22, Backend::Ssh);
            let err = render_dsn(Protocol::Ssh, &target, "x", &credentials("root", "")).unwrap_err();
            assert!(matches!(err, ConnectionError::DsnInvalid(_)));
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn test_accepts_normal_fields() {
            assert!(validate_fields("localhost", "root", "mysql").is_ok());
        }

        #[test]
        fn test_rejects_empty_host() {
            assert!(matches!(
                validate_fields("", "root", "mysql"),
                Err(ConnectionError::DsnInvalid(_))
            ));
        }

        #[test]
        fn test_rejects_empty_username() {
            assert!(validate_fields("localhost", "", "mysql").is_err());
        }

        #[test]
        fn test_rejects_separators() {
            assert!(validate_fields("local host", "root", "mysql").is_err());
            assert!(validate_fields("localhost", "root", "my/db").is_err());
            assert!(validate_fields("localhost", "root", "my db").is_err());
        }
    }

    mod pool {
        use super::*;

        #[tokio::test]
        async fn test_open_is_lazy() {
            // Nothing listens on port 1; opening must still succeed
            let target = Target::new(
                "127.0.0.1",
                1,
                Backend::MySql {
                    database: "test".to_string(),
                },
            );
            let mut session =
                SqlSession::open(&target, "test", &credentials("root", ""), Duration::from_secs(60))
                    .unwrap();
            assert_eq!(session.protocol(), Protocol::MySql);
            assert_eq!(session.dsn(), "root:@tcp(127.0.0.1:1)/test");
            session.close().await;
        }

        #[tokio::test]
        async fn test_open_rejects_invalid_fields() {
            let target = Target::new(
                "",
                5432,
                Backend::Postgres {
                    database: "postgres".to_string(),
                },
            );
            let result = SqlSession::open(
                &target,
                "postgres",
                &credentials("postgres", ""),
                Duration::ZERO,
            );
            assert!(matches!(result, Err(ConnectionError::DsnInvalid(_))));
        }

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let target = postgres_target();
            let mut session = SqlSession::open(
                &target,
                "postgres",
                &credentials("postgres", "pw"),
                Duration::from_secs(1),
            )
            .unwrap();
            session.close().await;
            session.close().await;

            let err = session
                .execute(&Operation::new("SELECT 1"), None)
                .await
                .unwrap_err();
            assert!(matches!(err, ExecutionError::QueryFailed(_)));
        }
    }

    mod tables {
        use super::*;

        struct FakeRow {
            columns: &'static [&'static str],
            cells: Vec<Result<Option<&'static str>, &'static str>>,
        }

        impl TextRow for FakeRow {
            fn column_names(&self) -> Vec<String> {
                self.columns.iter().map(|c| c.to_string()).collect()
            }

            fn width(&self) -> usize {
                self.cells.len()
            }

            fn text(&self, index: usize) -> Result<Option<String>, String> {
                self.cells[index]
                    .map(|cell| cell.map(str::to_string))
                    .map_err(str::to_string)
            }
        }

        fn row(cells: Vec<Option<&'static str>>) -> FakeRow {
            FakeRow {
                columns: &["id", "name"],
                cells: cells.into_iter().map(Ok).collect(),
            }
        }

        #[test]
        fn test_no_rows_gives_empty_table() {
            let table = tabulate::<FakeRow>(&[]).unwrap();
            assert!(table.columns.is_empty());
            assert!(table.rows.is_empty());
        }

        #[test]
        fn test_null_cell_is_none() {
            let table = tabulate(&[
                row(vec![Some("1"), None]),
                row(vec![Some("2"), Some("")]),
            ])
            .unwrap();

            assert_eq!(table.columns, vec!["id", "name"]);
            assert_eq!(
                table.rows,
                vec![
                    vec![Some("1".to_string()), None],
                    vec![Some("2".to_string()), Some(String::new())],
                ]
            );
        }

        #[test]
        fn test_undecodable_cell_fails_query() {
            let bad = FakeRow {
                columns: &["blob"],
                cells: vec![Err("invalid utf-8")],
            };
            let err = tabulate(&[bad]).unwrap_err();
            assert!(matches!(err, ExecutionError::QueryFailed(ref m) if m == "invalid utf-8"));
        }
    }
}
