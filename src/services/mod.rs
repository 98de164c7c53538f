use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::search::{SearchService, VectorStore};
use crate::tool::ToolSet;

pub mod search;
pub mod tools;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Health {
    pub status: String,
    pub model: String,
    pub dimension: usize,
}

async fn healthz<S: VectorStore>(
    Extension(service): Extension<Arc<SearchService<S>>>,
) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        model: service.encoder().model_name().to_string(),
        dimension: service.encoder().dimension(),
    })
}

pub fn routes<S: VectorStore>(service: Arc<SearchService<S>>, tool_set: ToolSet) -> Router {
    Router::new()
        .route("/healthz", get(healthz::<S>))
        .route("/v1/search", post(search::search_handler::<S>))
        .route("/v1/tools", get(tools::list_tools))
        .route("/v1/tools/{name}", post(tools::call_tool))
        .layer(Extension(service))
        .layer(Extension(Arc::new(tool_set)))
        .layer(TraceLayer::new_for_http())
}


#[tokio::test]
async fn test_healthz() {
    use test_support::*;

    let (status, body) = send(app(corpus()), "GET", "/healthz", "").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["dimension"], crate::embedding::EMB_DIM);
}
