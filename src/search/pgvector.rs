//! Cosine-distance k-NN over a pgvector column.
//!
//! Every search opens its own connection. The connection driver task is
//! aborted when the [`ScopedConnection`] is dropped, so the socket is closed on
//! success, on error and when the surrounding timeout fires.

use std::time::Duration;

use pgvector::Vector;
use tokio::task::JoinHandle;
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls, Row};

use super::{check_score, ScoredResult, VectorStore};
use crate::config::StoreConfig;
use crate::error::{Result, ServiceError};

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

/// `schema.table` or `table`, each part quoted.
pub fn qualified_table(table: &str) -> String {
    match table.split_once('.') {
        Some((schema, table)) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        None => quote_ident(table),
    }
}

fn search_sql(config: &StoreConfig) -> String {
    let id = quote_ident(&config.id_column);
    let emb = quote_ident(&config.embedding_column);
    let text = quote_ident(&config.text_column);
    format!(
        "SELECT \
            to_jsonb({id}) AS id, \
            1 - ({emb} <=> $1) AS score, \
            substring({text} for $3) AS snippet \
        FROM {table} \
        WHERE {emb} IS NOT NULL \
        ORDER BY {emb} <=> $1 ASC, {id} ASC \
        LIMIT $2",
        table = qualified_table(&config.table),
    )
}

const COLUMN_TYPE_SQL: &str = "SELECT t.typname::text AS typname, a.atttypmod AS typmod \
    FROM pg_attribute a \
    JOIN pg_type t ON t.oid = a.atttypid \
    WHERE a.attrelid = to_regclass($1) AND a.attname = $2 AND NOT a.attisdropped";

fn sample_dims_sql(config: &StoreConfig) -> String {
    let emb = quote_ident(&config.embedding_column);
    format!(
        "SELECT vector_dims({emb}) AS dims FROM {table} WHERE {emb} IS NOT NULL LIMIT 1",
        table = qualified_table(&config.table),
    )
}

/// SQLSTATE classes that mean the server is unreachable or refused us:
/// 08 connection exception, 28 invalid authorization, 53300 too many
/// connections, 57P0x operator intervention (shutdown).
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("28") || code.starts_with("57P") || code == "53300"
}

fn classify(err: tokio_postgres::Error) -> ServiceError {
    if let Some(db) = err.as_db_error() {
        let message = format!("{} ({})", db.message(), db.code().code());
        return if is_connection_sqlstate(db.code().code()) {
            ServiceError::Connection(message)
        } else {
            ServiceError::Query(message)
        };
    }
    let io = std::error::Error::source(&err)
        .map(|source| source.is::<std::io::Error>())
        .unwrap_or(false);
    if io || err.is_closed() {
        ServiceError::Connection(err.to_string())
    } else {
        ServiceError::Query(err.to_string())
    }
}

/// Checks the declared `vector(n)` modifier, falling back to one stored row
/// when the column was declared without a dimension.
pub fn check_dimension(expected: usize, typmod: i32, sample_dims: Option<i32>) -> Result<()> {
    let (found, source) = if typmod > 0 {
        (typmod, "column declaration")
    } else if let Some(dims) = sample_dims {
        (dims, "stored vector")
    } else {
        log::warn!("Embedding column has no declared dimension and no rows, skipping check");
        return Ok(());
    };
    if found as usize != expected {
        return Err(ServiceError::Query(format!(
            "datastore vectors have {} dimensions ({}), model produces {}",
            found, source, expected
        )));
    }
    Ok(())
}

struct ScopedConnection {
    client: Client,
    driver: JoinHandle<()>,
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

pub struct PgVectorStore {
    pg: tokio_postgres::Config,
    config: StoreConfig,
    search_sql: String,
    query_timeout: Duration,
}

impl PgVectorStore {
    pub fn new(config: &StoreConfig) -> Self {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .user(&config.user)
            .dbname(&config.database)
            .application_name("docsearch_server")
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if !config.password.is_empty() {
            pg.password(&config.password);
        }

        Self {
            pg,
            config: config.clone(),
            search_sql: search_sql(config),
            query_timeout: Duration::from_millis(config.query_timeout_ms),
        }
    }

    async fn connect(&self) -> Result<ScopedConnection> {
        let (client, connection) = self.pg.connect(NoTls).await.map_err(|e| {
            if e.as_db_error().is_some() {
                classify(e)
            } else {
                ServiceError::Connection(format!(
                    "failed to connect to {}:{}: {}",
                    self.config.host, self.config.port, e
                ))
            }
        })?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("postgres connection error: {}", e);
            }
        });
        Ok(ScopedConnection { client, driver })
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| {
                ServiceError::Connection(format!(
                    "datastore did not answer within {}ms",
                    self.query_timeout.as_millis()
                ))
            })?
    }

    /// Fails with `Query` when the embedding column is missing, is not a
    /// pgvector column, or holds vectors of another dimension.
    pub async fn verify_schema(&self, expected: usize) -> Result<()> {
        self.with_timeout(async {
            let conn = self.connect().await?;
            let table = qualified_table(&self.config.table);
            let row = conn
                .client
                .query_opt(
                    COLUMN_TYPE_SQL,
                    &[&table, &self.config.embedding_column],
                )
                .await
                .map_err(classify)?
                .ok_or_else(|| {
                    ServiceError::Query(format!(
                        "column {} not found in table {}",
                        self.config.embedding_column, self.config.table
                    ))
                })?;

            let typname: String = row.try_get("typname").map_err(classify)?;
            if typname != "vector" {
                return Err(ServiceError::Query(format!(
                    "column {} has type {}, expected vector",
                    self.config.embedding_column, typname
                )));
            }
            let typmod: i32 = row.try_get("typmod").map_err(classify)?;

            let sample_dims = if typmod > 0 {
                None
            } else {
                conn.client
                    .query_opt(sample_dims_sql(&self.config).as_str(), &[])
                    .await
                    .map_err(classify)?
                    .map(|row| row.try_get::<_, i32>("dims"))
                    .transpose()
                    .map_err(classify)?
            };
            check_dimension(expected, typmod, sample_dims)
        })
        .await
    }
}

fn scored_from_row(row: &Row) -> Result<ScoredResult> {
    let id: Option<Json<serde_json::Value>> = row.try_get("id").map_err(classify)?;
    let score = check_score(row.try_get("score").map_err(classify)?)?;
    let snippet: Option<String> = row.try_get("snippet").map_err(classify)?;
    Ok(ScoredResult {
        id: id.map(|Json(v)| v).unwrap_or(serde_json::Value::Null),
        score,
        snippet: snippet.unwrap_or_default(),
    })
}

impl VectorStore for PgVectorStore {
    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredResult>> {
        let vector = Vector::from(query.to_vec());
        let limit = i64::try_from(k)
            .map_err(|_| ServiceError::Validation(format!("k {} is too large", k)))?;
        let snippet_chars = i32::try_from(self.config.snippet_chars).map_err(|_| {
            ServiceError::Query(format!(
                "snippet_chars {} is out of range",
                self.config.snippet_chars
            ))
        })?;

        self.with_timeout(async {
            let conn = self.connect().await?;
            let rows = conn
                .client
                .query(self.search_sql.as_str(), &[&vector, &limit, &snippet_chars])
                .await
                .map_err(classify)?;
            rows.iter().map(scored_from_row).collect()
        })
        .await
    }
}

#[test]
fn test_search_sql_shape() {
    let sql = search_sql(&StoreConfig::default());
    assert!(sql.contains("1 - (\"emb\" <=> $1) AS score"));
    assert!(sql.contains("substring(\"text\" for $3) AS snippet"));
    assert!(sql.contains("FROM \"docs\""));
    assert!(sql.contains("ORDER BY \"emb\" <=> $1 ASC, \"id\" ASC"));
    assert!(sql.ends_with("LIMIT $2"));
}

#[test]
fn test_qualified_table() {
    assert_eq!(qualified_table("docs"), "\"docs\"");
    assert_eq!(qualified_table("public.docs"), "\"public\".\"docs\"");
    assert_eq!(qualified_table("we\"ird"), "\"we\"\"ird\"");
}

#[test]
fn test_sqlstate_classification() {
    assert!(is_connection_sqlstate("28P01"));
    assert!(is_connection_sqlstate("08006"));
    assert!(is_connection_sqlstate("57P01"));
    assert!(is_connection_sqlstate("53300"));
    assert!(!is_connection_sqlstate("42P01"));
    assert!(!is_connection_sqlstate("22000"));
}

#[test]
fn test_check_dimension() {
    assert!(check_dimension(384, 384, None).is_ok());
    assert!(matches!(
        check_dimension(384, 300, None),
        Err(ServiceError::Query(_))
    ));
    assert!(check_dimension(384, -1, Some(384)).is_ok());
    assert!(matches!(
        check_dimension(384, -1, Some(768)),
        Err(ServiceError::Query(_))
    ));
    assert!(check_dimension(384, -1, None).is_ok());
}

#[tokio::test]
async fn test_connection_refused_is_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let store = PgVectorStore::new(&StoreConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..StoreConfig::default()
    });
    let err = store
        .nearest(&[0.0f32; crate::embedding::EMB_DIM], 3)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Connection(_)), "{err:?}");
    assert!(matches!(
        store.verify_schema(crate::embedding::EMB_DIM).await,
        Err(ServiceError::Connection(_))
    ));
}

#[tokio::test]
async fn test_oversized_snippet_chars_is_query_error() {
    let store = PgVectorStore::new(&StoreConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        snippet_chars: u32::MAX,
        ..StoreConfig::default()
    });
    let err = store
        .nearest(&[0.0f32; crate::embedding::EMB_DIM], 3)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Query(_)), "{err:?}");
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accept = tokio::spawn(async move {
        let mut held = vec![];
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let store = PgVectorStore::new(&StoreConfig {
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout_ms: 5000,
        query_timeout_ms: 200,
        ..StoreConfig::default()
    });
    let start = std::time::Instant::now();
    let err = store
        .nearest(&[0.0f32; crate::embedding::EMB_DIM], 3)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Connection(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(2));
    accept.abort();
}
