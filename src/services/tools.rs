use std::sync::Arc;

use axum::{body::Bytes, extract::Path, Extension, Json};
use serde_json::Value;

use crate::error::{Result, ServiceError};
use crate::tool::{ToolInfo, ToolSet};

pub async fn list_tools(Extension(tool_set): Extension<Arc<ToolSet>>) -> Json<Vec<ToolInfo>> {
    Json(tool_set.list())
}

/// The request body is the tool's argument object; an empty body means `{}`.
pub async fn call_tool(
    Extension(tool_set): Extension<Arc<ToolSet>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let args = if body.iter().all(|b| b.is_ascii_whitespace()) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServiceError::Validation(format!("invalid JSON body: {}", e)))?
    };
    let result = tool_set.call(&name, args).await?;
    Ok(Json(result))
}
