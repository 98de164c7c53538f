use std::future::Future;
use std::time::Instant;

use crate::config::SearchConfig;
use crate::embedding::Encoder;
use crate::error::{Result, ServiceError};

#[cfg(test)]
pub mod memory;
pub mod pgvector;

/// One ranked hit. `score` is cosine similarity, `1 - cosine_distance`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoredResult {
    pub id: serde_json::Value,
    pub score: f64,
    pub snippet: String,
}

/// Rejects NaN and infinite scores. A zero stored vector has no direction, so
/// its cosine distance is undefined and the query fails as a whole.
pub fn check_score(score: f64) -> Result<f64> {
    if score.is_finite() {
        Ok(score)
    } else {
        Err(ServiceError::Query(
            "stored embedding produced a non-finite distance (zero vector?)".to_string(),
        ))
    }
}

/// A datastore able to answer k-nearest-neighbor queries by cosine distance.
///
/// Implementations return at most `k` rows ordered by ascending distance,
/// ties broken by ascending id, and never return partial results on error.
pub trait VectorStore: Send + Sync + 'static {
    fn nearest(
        &self,
        query: &[f32],
        k: usize,
    ) -> impl Future<Output = Result<Vec<ScoredResult>>> + Send;
}

pub struct SearchClient<S> {
    store: S,
    dimension: usize,
}

impl<S: VectorStore> SearchClient<S> {
    pub fn new(store: S, dimension: usize) -> Self {
        Self { store, dimension }
    }

    /// `query` must already be unit length; it is not re-normalized here.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredResult>> {
        if query.len() != self.dimension {
            return Err(ServiceError::Query(format!(
                "query vector has {} dimensions, expected {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 {
            return Err(ServiceError::Validation("k must be at least 1".to_string()));
        }
        self.store.nearest(query, k).await
    }
}

/// Validation, encoding and ranked lookup for one query.
pub struct SearchService<S> {
    encoder: Encoder,
    client: SearchClient<S>,
    settings: SearchConfig,
}

impl<S: VectorStore> SearchService<S> {
    pub fn new(encoder: Encoder, store: S, settings: SearchConfig) -> Self {
        let client = SearchClient::new(store, encoder.dimension());
        Self {
            encoder,
            client,
            settings,
        }
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn settings(&self) -> &SearchConfig {
        &self.settings
    }

    pub fn validate(&self, query: &str, k: Option<usize>) -> Result<usize> {
        if query.trim().is_empty() {
            return Err(ServiceError::Validation(
                "query text must not be empty".to_string(),
            ));
        }
        let chars = query.chars().count();
        if chars > self.settings.max_query_chars {
            return Err(ServiceError::Validation(format!(
                "query text is {} characters, limit is {}",
                chars, self.settings.max_query_chars
            )));
        }
        let k = k.unwrap_or(self.settings.default_k);
        if k < 1 || k > self.settings.max_k {
            return Err(ServiceError::Validation(format!(
                "k must be between 1 and {}, got {}",
                self.settings.max_k, k
            )));
        }
        Ok(k)
    }

    pub async fn query(&self, query: &str, k: Option<usize>) -> Result<Vec<ScoredResult>> {
        let k = self.validate(query, k)?;
        let request_id = uuid::Uuid::new_v4().as_u128();
        let start = Instant::now();
        log::info!("[Search] {request_id:x} query={:?} k={}", query, k);

        let vector = self.encoder.encode(query).await?;
        let encoded_ms = start.elapsed().as_millis();

        match self.client.search(&vector, k).await {
            Ok(results) => {
                log::info!(
                    "[Search] {request_id:x} {} results (encode {}ms, total {}ms)",
                    results.len(),
                    encoded_ms,
                    start.elapsed().as_millis()
                );
                Ok(results)
            }
            Err(e) => {
                log::warn!("[Search] {request_id:x} failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::embedding::testing::hashing_encoder;
    use crate::embedding::EMB_DIM;

    const CORPUS: [&str; 10] = [
        "machine learning basics for beginners",
        "a recipe for sourdough bread",
        "deep learning and machine learning models",
        "gardening tips for spring",
        "history of the roman empire",
        "basics of linear algebra",
        "machine translation with neural networks",
        "how to repair a bicycle",
        "learning to play the guitar",
        "stock market basics",
    ];

    fn service(store: MemoryStore) -> SearchService<MemoryStore> {
        SearchService::new(hashing_encoder(), store, SearchConfig::default())
    }

    fn corpus(n: usize) -> MemoryStore {
        let encoder = hashing_encoder();
        let mut store = MemoryStore::new(500);
        for (i, text) in CORPUS.iter().take(n).enumerate() {
            store.insert(
                serde_json::json!(i as i64 + 1),
                encoder.encode_blocking(text).unwrap(),
                text,
            );
        }
        store
    }

    fn assert_descending(results: &[ScoredResult]) {
        for pair in results.windows(2) {
            assert!(
                pair[0].score >= pair[1].score,
                "scores out of order: {:?}",
                results
            );
        }
    }

    #[tokio::test]
    async fn test_top_three_of_ten() {
        let service = service(corpus(10));
        let results = service
            .query("machine learning basics", Some(3))
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_descending(&results);
        assert_eq!(results[0].id, serde_json::json!(1));
        for r in &results {
            assert!((-1.0..=1.0).contains(&r.score));
        }
    }

    #[tokio::test]
    async fn test_k_larger_than_corpus() {
        let service = service(corpus(5));
        let results = service.query("anything at all", Some(100)).await.unwrap();
        assert_eq!(results.len(), 5);
        assert_descending(&results);
    }

    #[tokio::test]
    async fn test_min_k_n_for_all_k() {
        let service = service(corpus(10));
        for k in 1..=12 {
            let results = service.query("learning", Some(k)).await.unwrap();
            assert_eq!(results.len(), k.min(10));
            assert_descending(&results);
        }
    }

    #[tokio::test]
    async fn test_empty_corpus_is_not_an_error() {
        let service = service(MemoryStore::new(500));
        let results = service.query("machine learning", None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_queries_are_identical() {
        let service = service(corpus(10));
        let a = service.query("basics", Some(10)).await.unwrap();
        let b = service.query("basics", Some(10)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_default_k_is_five() {
        let service = service(corpus(10));
        let results = service.query("learning", None).await.unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn test_invalid_k_never_reaches_store() {
        let service = service(MemoryStore::unreachable());
        for k in [0, 101] {
            let err = service.query("learning", Some(k)).await.unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{err:?}");
        }
        let err = service.query("   ", Some(3)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        let long = "a".repeat(5000);
        let err = service.query(&long, Some(3)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_connection_error() {
        let service = service(MemoryStore::unreachable());
        let err = service.query("learning", Some(3)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Connection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_wrong_query_dimension_is_query_error() {
        let client = SearchClient::new(corpus(3), EMB_DIM);
        let err = client.search(&[0.05f32; 300], 3).await.unwrap_err();
        assert!(matches!(err, ServiceError::Query(_)), "{err:?}");
    }

    #[test]
    fn test_check_score() {
        assert_eq!(check_score(0.25).unwrap(), 0.25);
        assert_eq!(check_score(-1.0).unwrap(), -1.0);
        for score in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(check_score(score), Err(ServiceError::Query(_))));
        }
    }

    #[tokio::test]
    async fn test_zero_stored_vector_fails_whole_query() {
        let mut store = corpus(5);
        store.insert(serde_json::json!(99), vec![0.0f32; EMB_DIM], "empty vector");
        let service = service(store);
        let err = service.query("machine learning", Some(3)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Query(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_equal_distances_break_ties_by_id() {
        let mut store = MemoryStore::new(500);
        let mut v = vec![0.0f32; EMB_DIM];
        v[0] = 1.0;
        for id in [9, 2, 7, 4] {
            store.insert(serde_json::json!(id), v.clone(), "same");
        }
        let client = SearchClient::new(store, EMB_DIM);
        let results = client.search(&v, 4).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                serde_json::json!(2),
                serde_json::json!(4),
                serde_json::json!(7),
                serde_json::json!(9)
            ]
        );
    }
}
