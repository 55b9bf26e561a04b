//! Cross-source result ranking.
//!
//! Two stages: a cheap lexical pass orders everything, then for the balanced
//! and quality modes the best candidates are re-scored with embeddings. Fast
//! mode stops after the lexical pass. Ranking never fails a search: when the
//! embedder is down the lexical order stands.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use cartwheel_core::types::{OptimizationMode, SearchResult};
use cartwheel_providers::{Embedder, cosine_similarity};

/// Candidates sent to the embedding stage per mode.
const BALANCED_K: usize = 10;
const QUALITY_K: usize = 20;

/// Lexical scores of results outside the embedding window are damped so the
/// embedded head stays ahead of them.
const TAIL_DAMP: f64 = 0.3;

pub struct Reranker {
    embedder: Arc<dyn Embedder>,
}

impl Reranker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    /// Order `results` by relevance to `query` and fill `relevance_score`.
    pub async fn rank(
        &self,
        query: &str,
        mut results: Vec<SearchResult>,
        mode: OptimizationMode,
    ) -> Vec<SearchResult> {
        if results.is_empty() {
            return results;
        }
        let query_tokens: HashSet<String> = tokens(query).into_iter().collect();
        for r in &mut results {
            r.relevance_score = Some(lexical_score(&query_tokens, r));
        }
        sort_ranked(&mut results);

        let k = match mode {
            OptimizationMode::Fast => return results,
            OptimizationMode::Balanced => BALANCED_K,
            OptimizationMode::Quality => QUALITY_K,
        };
        let k = k.min(results.len());

        let mut inputs = Vec::with_capacity(k + 1);
        inputs.push(query.to_string());
        inputs.extend(results[..k].iter().map(embed_text));

        match self.embedder.embed(&inputs).await {
            Ok(vectors) if vectors.len() == k + 1 => {
                if let Some((query_vec, rest)) = vectors.split_first() {
                    for (r, v) in results[..k].iter_mut().zip(rest) {
                        let score = f64::from(cosine_similarity(query_vec, v)).max(0.0);
                        r.relevance_score = Some(score);
                    }
                    for r in &mut results[k..] {
                        r.relevance_score = Some(r.relevance_score.unwrap_or(0.0) * TAIL_DAMP);
                    }
                    sort_ranked(&mut results);
                }
            }
            Ok(vectors) => {
                warn!(
                    embedder = self.embedder.id(),
                    expected = k + 1,
                    got = vectors.len(),
                    "embedder returned wrong arity, keeping lexical order"
                );
            }
            Err(e) => {
                warn!(embedder = self.embedder.id(), error = %e, "embedding rerank failed, keeping lexical order");
            }
        }
        results
    }
}

fn sort_ranked(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        let sa = a.relevance_score.unwrap_or(0.0);
        let sb = b.relevance_score.unwrap_or(0.0);
        sb.total_cmp(&sa)
            .then_with(|| a.current_price.total_cmp(&b.current_price))
    });
}

/// Token overlap with the query, with small boosts when the brand or
/// category is named in it. Clamped to 1.0.
fn lexical_score(query_tokens: &HashSet<String>, result: &SearchResult) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let name_tokens: HashSet<String> = tokens(&result.name).into_iter().collect();
    let overlap =
        query_tokens.intersection(&name_tokens).count() as f64 / query_tokens.len() as f64;
    let mut score = overlap;
    if let Some(brand) = &result.brand {
        if tokens(brand).iter().any(|t| query_tokens.contains(t)) {
            score += 0.2;
        }
    }
    if let Some(category) = &result.category {
        if tokens(category).iter().any(|t| query_tokens.contains(t)) {
            score += 0.1;
        }
    }
    score.min(1.0)
}

fn embed_text(result: &SearchResult) -> String {
    let mut text = result.name.clone();
    if let Some(brand) = &result.brand {
        text.push(' ');
        text.push_str(brand);
    }
    if let Some(category) = &result.category {
        text.push(' ');
        text.push_str(category);
    }
    text
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use cartwheel_core::error::Result;

    fn result(name: &str, brand: Option<&str>, price: f64) -> SearchResult {
        SearchResult {
            product_id: format!("id-{name}"),
            name: name.into(),
            brand: brand.map(Into::into),
            category: None,
            url: format!("https://shop.example/p/{}", name.replace(' ', "-")),
            image: None,
            current_price: price,
            original_price: None,
            rating: None,
            source: "shop".into(),
            relevance_score: None,
        }
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn id(&self) -> &str {
            "counting"
        }
        fn dimensions(&self) -> usize {
            2
        }
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // The query aligns with inputs mentioning anker, nothing else.
            Ok(inputs
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    if i == 0 || text.to_lowercase().contains("anker") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn lexical_pass_orders_by_overlap_and_brand() {
        let reranker = Reranker::new(Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) }));
        let ranked = reranker
            .rank(
                "jbl flip speaker",
                vec![
                    result("Garden hose 20m", None, 15.0),
                    result("JBL Flip 6 speaker", Some("JBL"), 129.0),
                    result("Bluetooth speaker stand", None, 25.0),
                ],
                OptimizationMode::Fast,
            )
            .await;
        assert_eq!(ranked[0].name, "JBL Flip 6 speaker");
        assert_eq!(ranked[2].name, "Garden hose 20m");
        assert!(ranked[0].relevance_score.unwrap() > ranked[1].relevance_score.unwrap());
    }

    #[tokio::test]
    async fn fast_mode_skips_the_embedder() {
        let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) });
        let reranker = Reranker::new(embedder.clone());
        reranker
            .rank("speaker", vec![result("Speaker", None, 10.0)], OptimizationMode::Fast)
            .await;
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);

        reranker
            .rank("speaker", vec![result("Speaker", None, 10.0)], OptimizationMode::Balanced)
            .await;
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn embedding_stage_reorders_the_head() {
        let reranker = Reranker::new(Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) }));
        // Lexically "portable speaker" wins; the embedder prefers the Anker.
        let ranked = reranker
            .rank(
                "portable speaker",
                vec![
                    result("Portable speaker", None, 49.0),
                    result("Anker Soundcore 2", Some("Anker"), 39.0),
                ],
                OptimizationMode::Balanced,
            )
            .await;
        assert_eq!(ranked[0].name, "Anker Soundcore 2");
        assert!(ranked[0].relevance_score.unwrap() > 0.9);
    }

    #[tokio::test]
    async fn embedder_failure_keeps_lexical_order() {
        struct FailingEmbedder;

        #[async_trait]
        impl Embedder for FailingEmbedder {
            fn id(&self) -> &str {
                "failing"
            }
            fn dimensions(&self) -> usize {
                2
            }
            async fn embed(&self, _inputs: &[String]) -> Result<Vec<Vec<f32>>> {
                Err(cartwheel_core::error::CartwheelError::Cache("embedding api down".into()))
            }
        }

        let reranker = Reranker::new(Arc::new(FailingEmbedder));
        let ranked = reranker
            .rank(
                "jbl speaker",
                vec![
                    result("Desk lamp", None, 20.0),
                    result("JBL speaker", Some("JBL"), 100.0),
                ],
                OptimizationMode::Quality,
            )
            .await;
        assert_eq!(ranked[0].name, "JBL speaker");
    }

    #[tokio::test]
    async fn equal_scores_break_ties_by_price() {
        let reranker = Reranker::new(Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) }));
        let ranked = reranker
            .rank(
                "usb hub",
                vec![
                    result("USB hub", None, 29.0),
                    result("USB hub", None, 19.0),
                ],
                OptimizationMode::Fast,
            )
            .await;
        assert_eq!(ranked[0].current_price, 19.0);
    }
}
