//! File inspection tools, confined to one root directory.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use base64::Engine;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

use crate::config::FilesConfig;
use crate::error::{Result, ServiceError};
use crate::tool::{parse_args, Tool, ToolSet};

pub struct FileRoot {
    root: PathBuf,
    max_read_bytes: u64,
}

fn io_error(path: &Path, e: std::io::Error) -> ServiceError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ServiceError::NotFound(path.display().to_string())
    } else {
        ServiceError::Io(e)
    }
}

fn mtime(modified: std::io::Result<SystemTime>) -> Option<f64> {
    modified
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}

/// Resolves `..` and `.` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

impl FileRoot {
    pub fn new(config: &FilesConfig) -> anyhow::Result<Self> {
        let root = std::fs::canonicalize(&config.root).map_err(|e| {
            anyhow::anyhow!("files.root {} is not usable: {}", config.root.display(), e)
        })?;
        Ok(Self {
            root,
            max_read_bytes: config.max_read_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn resolve(&self, path: &str) -> Result<PathBuf> {
        let path = match path.strip_prefix("~/") {
            Some(rest) => std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(rest))
                .unwrap_or_else(|| PathBuf::from(path)),
            None => PathBuf::from(path),
        };
        let candidate = if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        };
        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => normalize_lexically(&candidate),
            Err(e) => return Err(ServiceError::Io(e)),
        };
        if !resolved.starts_with(&self.root) {
            return Err(ServiceError::Validation(format!(
                "path {} is outside of {}",
                candidate.display(),
                self.root.display()
            )));
        }
        Ok(resolved)
    }

    async fn check_size(&self, path: &Path) -> Result<()> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_error(path, e))?;
        if meta.len() > self.max_read_bytes {
            return Err(ServiceError::Validation(format!(
                "{} is {} bytes, read limit is {}",
                path.display(),
                meta.len(),
                self.max_read_bytes
            )));
        }
        Ok(())
    }

    async fn read_bounded(&self, path: &Path) -> Result<Vec<u8>> {
        self.check_size(path).await?;
        tokio::fs::read(path).await.map_err(|e| io_error(path, e))
    }

    pub async fn ls(&self, path: &str, pattern: Option<&str>, max_items: usize) -> Result<Value> {
        let dir = self.resolve(path).await?;
        let is_dir = tokio::fs::metadata(&dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(ServiceError::NotFound(format!(
                "not a directory: {}",
                dir.display()
            )));
        }

        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        let mut children = vec![];
        while let Some(entry) = read_dir.next_entry().await? {
            children.push(entry.path());
        }
        children.sort();

        let mut items = vec![];
        for (i, child) in children.iter().enumerate() {
            if i >= max_items {
                break;
            }
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Some(pattern) = pattern {
                if !name.contains(pattern) {
                    continue;
                }
            }
            match tokio::fs::metadata(child).await {
                Ok(meta) => items.push(json!({
                    "name": name,
                    "path": child.display().to_string(),
                    "is_dir": meta.is_dir(),
                    "size": meta.len(),
                    "mtime": mtime(meta.modified()),
                })),
                Err(e) => items.push(json!({
                    "name": name,
                    "path": child.display().to_string(),
                    "error": e.to_string(),
                })),
            }
        }
        Ok(Value::Array(items))
    }

    pub async fn stat(&self, path: &str) -> Result<Value> {
        let path = self.resolve(path).await?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(json!({
                "path": path.display().to_string(),
                "exists": true,
                "is_dir": meta.is_dir(),
                "size": meta.len(),
                "mtime": mtime(meta.modified()),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(json!({
                "path": path.display().to_string(),
                "exists": false,
                "is_dir": false,
                "size": null,
                "mtime": null,
            })),
            Err(e) => Err(ServiceError::Io(e)),
        }
    }

    pub async fn read_text(&self, path: &str, n: Option<usize>) -> Result<Value> {
        let path = self.resolve(path).await?;
        let data = self.read_bounded(&path).await?;
        let text = String::from_utf8(data).map_err(|_| {
            ServiceError::Validation(format!("{} is not valid UTF-8", path.display()))
        })?;
        let text = match n {
            Some(n) => text.chars().take(n).collect(),
            None => text,
        };
        Ok(json!({ "path": path.display().to_string(), "text": text }))
    }

    pub async fn read_bytes_b64(&self, path: &str, n: Option<u64>) -> Result<Value> {
        let path = self.resolve(path).await?;
        let data = match n {
            Some(n) if n <= self.max_read_bytes => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| io_error(&path, e))?;
                let mut data = vec![];
                file.take(n).read_to_end(&mut data).await?;
                data
            }
            _ => self.read_bounded(&path).await?,
        };
        Ok(json!({
            "path": path.display().to_string(),
            "b64": base64::prelude::BASE64_STANDARD.encode(&data),
        }))
    }

    pub async fn head_csv(&self, path: &str, n: usize) -> Result<Value> {
        let path = self.resolve(path).await?;
        self.check_size(&path).await?;
        tokio::task::spawn_blocking(move || read_csv_head(&path, n))
            .await
            .map_err(|e| ServiceError::Io(std::io::Error::other(e)))?
    }

    pub async fn read_json(&self, path: &str) -> Result<Value> {
        let path = self.resolve(path).await?;
        let data = self.read_bounded(&path).await?;
        serde_json::from_slice(&data).map_err(|e| {
            ServiceError::Validation(format!("{} is not valid JSON: {}", path.display(), e))
        })
    }
}

/// Empty cells become `null`, numbers and booleans are typed.
fn csv_cell(cell: &str) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return json!(f);
        }
        return Value::Null;
    }
    match trimmed {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

fn read_csv_head(path: &Path, n: usize) -> Result<Value> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| csv_error(path, e))?;
    let headers = reader.headers().map_err(|e| csv_error(path, e))?.clone();
    let mut rows = vec![];
    for record in reader.records().take(n) {
        let record = record.map_err(|e| csv_error(path, e))?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, cell)| (h.to_string(), csv_cell(cell)))
            .collect::<serde_json::Map<_, _>>();
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

fn csv_error(path: &Path, e: csv::Error) -> ServiceError {
    if e.is_io_error() {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => io_error(path, io),
            other => ServiceError::Validation(format!("{:?}", other)),
        }
    } else {
        ServiceError::Validation(format!("{} is not valid CSV: {}", path.display(), e))
    }
}

fn path_schema(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

#[derive(serde::Deserialize)]
struct LsArgs {
    #[serde(default = "default_ls_path")]
    path: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default = "default_max_items")]
    max_items: usize,
}

fn default_ls_path() -> String {
    ".".to_string()
}

fn default_max_items() -> usize {
    100
}

#[derive(serde::Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(serde::Deserialize)]
struct ReadTextArgs {
    path: String,
    #[serde(default)]
    n: Option<usize>,
}

#[derive(serde::Deserialize)]
struct ReadBytesArgs {
    path: String,
    #[serde(default)]
    n: Option<u64>,
}

#[derive(serde::Deserialize)]
struct HeadCsvArgs {
    path: String,
    #[serde(default = "default_csv_rows")]
    n: usize,
}

fn default_csv_rows() -> usize {
    5
}

#[derive(Clone, Copy)]
enum FileOp {
    Ls,
    Stat,
    ReadText,
    ReadBytesB64,
    HeadCsv,
    ReadJson,
}

impl FileOp {
    const ALL: [FileOp; 6] = [
        FileOp::Ls,
        FileOp::Stat,
        FileOp::ReadText,
        FileOp::ReadBytesB64,
        FileOp::HeadCsv,
        FileOp::ReadJson,
    ];
}

pub struct FileTool {
    op: FileOp,
    root: Arc<FileRoot>,
}

impl Tool for FileTool {
    fn name(&self) -> String {
        match self.op {
            FileOp::Ls => "ls",
            FileOp::Stat => "stat",
            FileOp::ReadText => "read_text",
            FileOp::ReadBytesB64 => "read_bytes_b64",
            FileOp::HeadCsv => "head_csv",
            FileOp::ReadJson => "read_json",
        }
        .to_string()
    }

    fn description(&self) -> String {
        match self.op {
            FileOp::Ls => "List directory items with basic metadata.",
            FileOp::Stat => "Return basic file info.",
            FileOp::ReadText => "Read a UTF-8 text file (full or first n characters).",
            FileOp::ReadBytesB64 => {
                "Read a binary file and return a base64 string (full or first n bytes)."
            }
            FileOp::HeadCsv => "Return the first n rows of a CSV file as a list of objects.",
            FileOp::ReadJson => "Read a JSON file and return the parsed data.",
        }
        .to_string()
    }

    fn parameters(&self) -> Value {
        match self.op {
            FileOp::Ls => json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "default": "." },
                    "pattern": { "type": "string", "description": "Substring the name must contain." },
                    "max_items": { "type": "integer", "default": 100, "minimum": 0 }
                }
            }),
            FileOp::Stat | FileOp::ReadJson => json!({
                "type": "object",
                "properties": { "path": path_schema("File path.") },
                "required": ["path"]
            }),
            FileOp::ReadText => json!({
                "type": "object",
                "properties": {
                    "path": path_schema("Text file path."),
                    "n": { "type": "integer", "minimum": 0, "description": "Characters to read." }
                },
                "required": ["path"]
            }),
            FileOp::ReadBytesB64 => json!({
                "type": "object",
                "properties": {
                    "path": path_schema("File path."),
                    "n": { "type": "integer", "minimum": 0, "description": "Bytes to read." }
                },
                "required": ["path"]
            }),
            FileOp::HeadCsv => json!({
                "type": "object",
                "properties": {
                    "path": path_schema("CSV file path."),
                    "n": { "type": "integer", "default": 5, "minimum": 0 }
                },
                "required": ["path"]
            }),
        }
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let root = &self.root;
            match self.op {
                FileOp::Ls => {
                    let args: LsArgs = parse_args(args)?;
                    root.ls(&args.path, args.pattern.as_deref(), args.max_items)
                        .await
                }
                FileOp::Stat => {
                    let args: PathArgs = parse_args(args)?;
                    root.stat(&args.path).await
                }
                FileOp::ReadText => {
                    let args: ReadTextArgs = parse_args(args)?;
                    root.read_text(&args.path, args.n).await
                }
                FileOp::ReadBytesB64 => {
                    let args: ReadBytesArgs = parse_args(args)?;
                    root.read_bytes_b64(&args.path, args.n).await
                }
                FileOp::HeadCsv => {
                    let args: HeadCsvArgs = parse_args(args)?;
                    root.head_csv(&args.path, args.n).await
                }
                FileOp::ReadJson => {
                    let args: PathArgs = parse_args(args)?;
                    root.read_json(&args.path).await
                }
            }
        })
    }
}

pub fn add_file_tools(tool_set: &mut ToolSet, root: Arc<FileRoot>) {
    for op in FileOp::ALL {
        tool_set.add_tool(FileTool {
            op,
            root: root.clone(),
        });
    }
}
