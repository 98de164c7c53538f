//! Brute-force store with the same ordering contract as the pgvector query.

use std::cmp::Ordering;

use super::{check_score, ScoredResult, VectorStore};
use crate::error::{Result, ServiceError};

struct Document {
    id: serde_json::Value,
    embedding: Vec<f32>,
    text: String,
}

pub struct MemoryStore {
    docs: Vec<Document>,
    snippet_chars: usize,
    unreachable: bool,
}

impl MemoryStore {
    pub fn new(snippet_chars: usize) -> Self {
        Self {
            docs: Vec::new(),
            snippet_chars,
            unreachable: false,
        }
    }

    /// Every lookup fails as if the datastore refused the connection.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new(500)
        }
    }

    pub fn insert(&mut self, id: serde_json::Value, embedding: Vec<f32>, text: &str) {
        self.docs.push(Document {
            id,
            embedding,
            text: text.to_string(),
        });
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    1.0 - dot / (na * nb)
}

fn cmp_ids(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    match (a.as_i64(), b.as_i64()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

impl VectorStore for MemoryStore {
    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredResult>> {
        if self.unreachable {
            return Err(ServiceError::Connection(
                "connection refused (os error 111)".to_string(),
            ));
        }

        let mut ranked = Vec::with_capacity(self.docs.len());
        for doc in &self.docs {
            if doc.embedding.len() != query.len() {
                return Err(ServiceError::Query(format!(
                    "different vector dimensions {} and {}",
                    doc.embedding.len(),
                    query.len()
                )));
            }
            let distance = cosine_distance(&doc.embedding, query);
            check_score(1.0 - distance)?;
            ranked.push((distance, doc));
        }
        ranked.sort_by(|(da, a), (db, b)| {
            da.partial_cmp(db)
                .unwrap_or(Ordering::Equal)
                .then_with(|| cmp_ids(&a.id, &b.id))
        });
        ranked.truncate(k);

        Ok(ranked
            .into_iter()
            .map(|(distance, doc)| ScoredResult {
                id: doc.id.clone(),
                score: 1.0 - distance,
                snippet: doc.text.chars().take(self.snippet_chars).collect(),
            })
            .collect())
    }
}

#[tokio::test]
async fn test_snippet_is_bounded_by_chars() {
    let mut store = MemoryStore::new(4);
    store.insert(serde_json::json!("a"), vec![1.0, 0.0], "héllo wörld");
    let results = store.nearest(&[1.0, 0.0], 1).await.unwrap();
    assert_eq!(results[0].snippet, "héll");
    assert!((results[0].score - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_opposite_vector_scores_minus_one() {
    let mut store = MemoryStore::new(10);
    store.insert(serde_json::json!(1), vec![-1.0, 0.0], "opposite");
    let results = store.nearest(&[1.0, 0.0], 1).await.unwrap();
    assert!((results[0].score + 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_zero_document_vector_is_query_error() {
    let mut store = MemoryStore::new(10);
    store.insert(serde_json::json!(1), vec![1.0, 0.0], "fine");
    store.insert(serde_json::json!(2), vec![0.0, 0.0], "zero");
    let err = store.nearest(&[1.0, 0.0], 1).await.unwrap_err();
    assert!(matches!(err, ServiceError::Query(_)), "{err:?}");
}
