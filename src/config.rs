use std::path::PathBuf;

fn default_addr() -> String {
    "127.0.0.1:8011".to_string()
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_database() -> String {
    "postgres".to_string()
}

fn default_table() -> String {
    "docs".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_embedding_column() -> String {
    "emb".to_string()
}

fn default_text_column() -> String {
    "text".to_string()
}

fn default_snippet_chars() -> u32 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_query_timeout_ms() -> u64 {
    10000
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pg_database")]
    pub database: String,

    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_embedding_column")]
    pub embedding_column: String,
    #[serde(default = "default_text_column")]
    pub text_column: String,

    /// Characters of document text returned with each hit.
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound for connect + query of a single search.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Refuse to start when the datastore is unreachable.
    #[serde(default)]
    pub require_on_startup: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: String::new(),
            database: default_pg_database(),
            table: default_table(),
            id_column: default_id_column(),
            embedding_column: default_embedding_column(),
            text_column: default_text_column(),
            snippet_chars: default_snippet_chars(),
            connect_timeout_ms: default_connect_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            require_on_startup: false,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("database", &self.database)
            .field("table", &self.table)
            .field("id_column", &self.id_column)
            .field("embedding_column", &self.embedding_column)
            .field("text_column", &self.text_column)
            .field("snippet_chars", &self.snippet_chars)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("query_timeout_ms", &self.query_timeout_ms)
            .field("require_on_startup", &self.require_on_startup)
            .finish()
    }
}

fn default_model_name() -> String {
    "all-MiniLM-L6-v2".to_string()
}

fn default_dimension() -> usize {
    crate::embedding::EMB_DIM
}

fn default_show_download_progress() -> bool {
    true
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Must match both the model output and the stored vectors.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_show_download_progress")]
    pub show_download_progress: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            dimension: default_dimension(),
            cache_dir: None,
            show_download_progress: default_show_download_progress(),
        }
    }
}

fn default_k() -> usize {
    5
}

fn default_max_k() -> usize {
    100
}

fn default_max_query_chars() -> usize {
    2048
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            max_query_chars: default_max_query_chars(),
        }
    }
}

fn default_files_enabled() -> bool {
    true
}

fn default_files_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_read_bytes() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_files_enabled")]
    pub enabled: bool,
    #[serde(default = "default_files_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            enabled: default_files_enabled(),
            root: default_files_root(),
            max_read_bytes: default_max_read_bytes(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub files: FilesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            store: StoreConfig::default(),
            model: ModelConfig::default(),
            search: SearchConfig::default(),
            files: FilesConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file {} not found, using defaults", path);
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overrides file values with `DOCSEARCH_*` variables.
    pub fn apply_env<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = var("DOCSEARCH_ADDR") {
            self.addr = addr;
        }
        if let Some(host) = var("DOCSEARCH_PG_HOST") {
            self.store.host = host;
        }
        if let Some(port) = var("DOCSEARCH_PG_PORT") {
            self.store.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid DOCSEARCH_PG_PORT: {}", port))?;
        }
        if let Some(user) = var("DOCSEARCH_PG_USER") {
            self.store.user = user;
        }
        if let Some(password) = var("DOCSEARCH_PG_PASSWORD") {
            self.store.password = password;
        }
        if let Some(database) = var("DOCSEARCH_PG_DATABASE") {
            self.store.database = database;
        }
        if let Some(model) = var("DOCSEARCH_MODEL") {
            self.model.name = model;
        }
        if let Some(root) = var("DOCSEARCH_FILES_ROOT") {
            self.files.root = PathBuf::from(root);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.model.dimension > 0, "model.dimension must be positive");
        anyhow::ensure!(self.search.max_k >= 1, "search.max_k must be at least 1");
        anyhow::ensure!(
            (1..=self.search.max_k).contains(&self.search.default_k),
            "search.default_k must be within 1..={}",
            self.search.max_k
        );
        anyhow::ensure!(
            self.store.snippet_chars > 0 && self.store.snippet_chars <= i32::MAX as u32,
            "store.snippet_chars out of range"
        );
        anyhow::ensure!(
            self.store.query_timeout_ms > 0,
            "store.query_timeout_ms must be positive"
        );
        for (field, value) in [
            ("store.table", &self.store.table),
            ("store.id_column", &self.store.id_column),
            ("store.embedding_column", &self.store.embedding_column),
            ("store.text_column", &self.store.text_column),
        ] {
            anyhow::ensure!(!value.trim().is_empty(), "{} is required", field);
        }
        Ok(())
    }
}

#[test]
fn test_parse_partial_config() {
    let config = Config::parse(
        r#"
addr = "0.0.0.0:9000"

[store]
host = "db.internal"
port = 5431
user = "admin"
password = "secret"
database = "testdb"

[search]
max_k = 50
"#,
    )
    .unwrap();
    assert_eq!(config.addr, "0.0.0.0:9000");
    assert_eq!(config.store.port, 5431);
    assert_eq!(config.store.table, "docs");
    assert_eq!(config.store.embedding_column, "emb");
    assert_eq!(config.store.snippet_chars, 500);
    assert_eq!(config.model.name, "all-MiniLM-L6-v2");
    assert_eq!(config.model.dimension, 384);
    assert_eq!(config.search.default_k, 5);
    assert_eq!(config.search.max_k, 50);
    assert!(config.files.enabled);
    config.validate().unwrap();
}

#[test]
fn test_env_overrides() {
    let mut config = Config::default();
    let vars = std::collections::HashMap::from([
        ("DOCSEARCH_PG_HOST", "10.0.0.5"),
        ("DOCSEARCH_PG_PORT", "6543"),
        ("DOCSEARCH_PG_PASSWORD", "hunter2"),
        ("DOCSEARCH_MODEL", "BAAI/bge-small-en-v1.5"),
    ]);
    config
        .apply_env(|key| vars.get(key).map(|v| v.to_string()))
        .unwrap();
    assert_eq!(config.store.host, "10.0.0.5");
    assert_eq!(config.store.port, 6543);
    assert_eq!(config.store.password, "hunter2");
    assert_eq!(config.store.user, "postgres");
    assert_eq!(config.model.name, "BAAI/bge-small-en-v1.5");

    let debug = format!("{:?}", config.store);
    assert!(!debug.contains("hunter2"));
}

#[test]
fn test_invalid_env_port() {
    let mut config = Config::default();
    let err = config
        .apply_env(|key| (key == "DOCSEARCH_PG_PORT").then(|| "not-a-port".to_string()))
        .unwrap_err();
    assert!(err.to_string().contains("DOCSEARCH_PG_PORT"));
}

#[test]
fn test_validate_rejects_default_k_above_max() {
    let mut config = Config::default();
    config.search.max_k = 3;
    config.search.default_k = 5;
    assert!(config.validate().is_err());
}

#[test]
fn test_example_config_is_valid() {
    let config = Config::parse(include_str!("../config.example.toml")).unwrap();
    config.validate().unwrap();
    assert_eq!(config.store.port, 5431);
    assert_eq!(config.search.max_k, 100);
}
