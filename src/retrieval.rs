//! Relevance filtering on top of the index gateway.
//!
//! Retrieval is restricted to the user's selected sources, limited to the `k`
//! nearest fragments and then cut at a distance threshold. Distances are
//! "lower is closer", so the threshold is an upper bound.

use std::collections::BTreeSet;

use crate::error::DocletError;
use crate::index::{IndexGateway, SourceFilter};
use crate::models::RetrievedFragment;

/// Fetch the fragments relevant to `query` among `allowed` sources.
///
/// Returns an empty list when no index exists yet or nothing is selected.
/// Results are ascending by distance, at most `k` long, and every returned
/// distance is `<= threshold`.
pub async fn retrieve(
    gateway: Option<&IndexGateway>,
    query: &str,
    allowed: &BTreeSet<String>,
    k: usize,
    threshold: f32,
) -> Result<Vec<RetrievedFragment>, DocletError> {
    let Some(gateway) = gateway else {
        return Ok(Vec::new());
    };
    if allowed.is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let filter = SourceFilter::new(allowed.iter().cloned());
    let candidates = gateway.query(query, k, &filter).await?;
    let total = candidates.len();

    let relevant: Vec<RetrievedFragment> = candidates
        .into_iter()
        .filter(|r| r.distance <= threshold)
        .take(k)
        .collect();

    tracing::debug!(
        candidates = total,
        relevant = relevant.len(),
        threshold,
        "retrieval complete"
    );
    Ok(relevant)
}
