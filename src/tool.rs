use std::{collections::HashMap, fmt::Debug, sync::Arc};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, ServiceError};
use crate::search::{SearchService, VectorStore};

pub trait Tool: Send + Sync {
    fn name(&self) -> String;
    fn description(&self) -> String;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Deserializes tool arguments; `null` is treated as `{}`.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| ServiceError::Validation(format!("invalid arguments: {}", e)))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.tools.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("ToolSet").field("tools", &names).finish()
    }
}

impl ToolSet {
    pub fn add_tool<T: Tool + 'static>(&mut self, tool: T) {
        log::info!("add tool: {}", tool.name());
        self.tools.insert(tool.name(), Arc::new(tool));
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool descriptions, sorted by name.
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut infos = self
            .tools
            .values()
            .map(|tool| ToolInfo {
                name: tool.name(),
                description: tool.description(),
                parameters: tool.parameters(),
            })
            .collect::<Vec<_>>();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let tool = self
            .get_tool(name)
            .ok_or_else(|| ServiceError::NotFound(format!("tool {}", name)))?;
        log::debug!("call tool {} arguments: {}", name, args);
        tool.call(args).await
    }
}

/// Converts a caller-supplied `k` into the range the search service accepts.
pub fn k_from_i64(k: Option<i64>) -> Result<Option<usize>> {
    k.map(|k| {
        usize::try_from(k)
            .map_err(|_| ServiceError::Validation(format!("k must be positive, got {}", k)))
    })
    .transpose()
}

#[derive(Debug, serde::Deserialize)]
struct SearchVectorArgs {
    query: String,
    #[serde(default)]
    k: Option<i64>,
}

pub struct SearchVectorTool<S> {
    service: Arc<SearchService<S>>,
}

impl<S: VectorStore> SearchVectorTool<S> {
    pub fn new(service: Arc<SearchService<S>>) -> Self {
        Self { service }
    }
}

impl<S: VectorStore> Tool for SearchVectorTool<S> {
    fn name(&self) -> String {
        "search_vector".to_string()
    }

    fn description(&self) -> String {
        format!(
            "Semantic vector search over the document table. The query is encoded with {} \
             ({} dimensions) and matched against stored vectors by cosine distance. \
             Returns the top k documents as {{id, score, snippet}}, best match first.",
            self.service.encoder().model_name(),
            self.service.encoder().dimension()
        )
    }

    fn parameters(&self) -> Value {
        let settings = self.service.settings();
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The natural language search query."
                },
                "k": {
                    "type": "integer",
                    "description": "Number of documents to return.",
                    "default": settings.default_k,
                    "minimum": 1,
                    "maximum": settings.max_k
                }
            },
            "required": ["query"]
        })
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let args: SearchVectorArgs = parse_args(args)?;
            let k = k_from_i64(args.k)?;
            let results = self.service.query(&args.query, k).await?;
            serde_json::to_value(results)
                .map_err(|e| ServiceError::Query(format!("failed to serialize results: {}", e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::embedding::testing::hashing_encoder;
    use crate::search::memory::MemoryStore;

    fn tool_set() -> ToolSet {
        let encoder = hashing_encoder();
        let mut store = MemoryStore::new(500);
        for (id, text) in [(1, "rust async runtimes"), (2, "baking bread at home")] {
            store.insert(
                serde_json::json!(id),
                encoder.encode_blocking(text).unwrap(),
                text,
            );
        }
        let service = Arc::new(SearchService::new(
            encoder,
            store,
            SearchConfig::default(),
        ));
        let mut tools = ToolSet::default();
        tools.add_tool(SearchVectorTool::new(service));
        tools
    }

    #[tokio::test]
    async fn test_search_vector_tool() {
        let tools = tool_set();
        let result = tools
            .call(
                "search_vector",
                serde_json::json!({"query": "async rust", "k": 1}),
            )
            .await
            .unwrap();
        let results = result.as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], 1);
        assert_eq!(results[0]["snippet"], "rust async runtimes");
    }

    #[tokio::test]
    async fn test_search_vector_tool_rejects_bad_args() {
        let tools = tool_set();
        let err = tools
            .call("search_vector", serde_json::json!({"k": 3}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = tools
            .call("search_vector", serde_json::json!({"query": "x", "k": -1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let tools = tool_set();
        let err = tools.call("drop_table", Value::Null).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn test_list_describes_parameters() {
        let infos = tool_set().list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "search_vector");
        assert_eq!(infos[0].parameters["properties"]["k"]["default"], 5);
        assert_eq!(infos[0].parameters["properties"]["k"]["maximum"], 100);
    }
}
