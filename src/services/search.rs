use std::sync::Arc;

use axum::{extract::rejection::JsonRejection, Extension, Json};

use crate::error::{Result, ServiceError};
use crate::search::{ScoredResult, SearchService, VectorStore};
use crate::tool::k_from_i64;

#[derive(Debug, serde::Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<i64>,
}

pub async fn search_handler<S: VectorStore>(
    Extension(service): Extension<Arc<SearchService<S>>>,
    request: std::result::Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<Vec<ScoredResult>>> {
    let Json(request) = request.map_err(|e| ServiceError::Validation(e.body_text()))?;
    let k = k_from_i64(request.k)?;
    let results = service.query(&request.query, k).await?;
    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use crate::search::memory::MemoryStore;
    use crate::services::test_support::*;

    #[tokio::test]
    async fn test_search_ranks_results() {
        let (status, body) = send(
            app(corpus()),
            "POST",
            "/v1/search",
            r#"{"query": "machine learning", "k": 3}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 3);
        let scores: Vec<f64> = results
            .iter()
            .map(|r| r["score"].as_f64().unwrap())
            .collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{scores:?}");
        let top: Vec<i64> = results[..2]
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert!(top.contains(&1) && top.contains(&3), "{body}");
        assert!(results[0]["snippet"].as_str().unwrap().contains("machine"));
    }

    #[tokio::test]
    async fn test_search_default_k() {
        let (status, body) = send(
            app(corpus()),
            "POST",
            "/v1/search",
            r#"{"query": "jazz"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // default k is 5, corpus has 4
        assert_eq!(body.as_array().unwrap().len(), 4);
        assert_eq!(body[0]["id"], 4);
    }

    #[tokio::test]
    async fn test_search_empty_corpus() {
        let (status, body) = send(
            app(MemoryStore::new(500)),
            "POST",
            "/v1/search",
            r#"{"query": "jazz", "k": 3}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_search_validation_errors() {
        for body in [
            r#"{"query": "jazz", "k": 0}"#,
            r#"{"query": "jazz", "k": -4}"#,
            r#"{"query": "jazz", "k": 1000}"#,
            r#"{"query": ""}"#,
            r#"{"k": 3}"#,
            "not json",
        ] {
            let (status, response) = send(app(corpus()), "POST", "/v1/search", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(response["error"], "validation_error", "{body}");
        }
    }

    #[tokio::test]
    async fn test_search_connection_refused() {
        let (status, body) = send(
            app(MemoryStore::unreachable()),
            "POST",
            "/v1/search",
            r#"{"query": "jazz", "k": 3}"#,
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "connection_error");
        assert!(body.get("results").is_none());
    }
}
