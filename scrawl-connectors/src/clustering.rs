//! Clustering provider contract and a lexical fallback implementation

use crate::entities::{ClusteringMethod, Note, NoteId};
use crate::error::ConnectorResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Candidate cluster returned by a provider, before ids are assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCandidate {
    pub label: String,
    pub member_ids: Vec<NoteId>,
    pub confidence: f32,
    pub centroid: Option<Vec<f32>>,
}

/// Groups cleaned notes into semantically related clusters
#[async_trait]
pub trait ClusteringProvider: Send + Sync {
    /// Cluster the given notes into roughly `target` groups
    async fn cluster(
        &self,
        notes: &[Note],
        method: ClusteringMethod,
        target: usize,
    ) -> ConnectorResult<Vec<ClusterCandidate>>;
}

/// Deterministic token-overlap clusterer
///
/// Stands in for the embedding/LLM providers in tests and the demo. Notes
/// are greedily merged into the candidate whose token set overlaps most;
/// a fresh cluster is opened while fewer than `target` exist.
pub struct LexicalClusterer;

impl LexicalClusterer {
    pub fn new() -> Self {
        Self
    }

    fn tokens(note: &Note) -> BTreeSet<String> {
        note.cleaned_text
            .as_deref()
            .unwrap_or(&note.text)
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|w| !w.is_empty())
            .collect()
    }

    fn overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> usize {
        a.intersection(b).count()
    }
}

impl Default for LexicalClusterer {
    fn default() -> Self {
        Self::new()
    }
}

struct Bucket {
    members: Vec<NoteId>,
    tokens: BTreeSet<String>,
}

#[async_trait]
impl ClusteringProvider for LexicalClusterer {
    async fn cluster(
        &self,
        notes: &[Note],
        _method: ClusteringMethod,
        target: usize,
    ) -> ConnectorResult<Vec<ClusterCandidate>> {
        let target = target.max(1);
        let mut buckets: Vec<Bucket> = Vec::new();

        // Stable iteration order keeps the result deterministic
        let mut sorted: Vec<&Note> = notes.iter().collect();
        sorted.sort_by(|a, b| a.original_id.cmp(&b.original_id));

        for note in sorted {
            let tokens = Self::tokens(note);
            let best = buckets
                .iter_mut()
                .enumerate()
                .map(|(i, b)| (Self::overlap(&b.tokens, &tokens), i))
                .max_by_key(|(score, _)| *score);

            match best {
                Some((score, i)) if score > 0 || buckets.len() >= target => {
                    let bucket = &mut buckets[i];
                    bucket.members.push(note.id);
                    bucket.tokens.extend(tokens);
                }
                _ => buckets.push(Bucket {
                    members: vec![note.id],
                    tokens,
                }),
            }
        }

        debug!(notes = notes.len(), target_clusters = target, buckets = buckets.len(), "lexical clustering grouped notes");
        Ok(buckets
            .into_iter()
            .map(|b| {
                // Label from the most distinctive tokens
                let label = b
                    .tokens
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ");
                let size = b.members.len();
                ClusterCandidate {
                    label: if label.is_empty() {
                        "unlabelled".to_string()
                    } else {
                        label
                    },
                    member_ids: b.members,
                    confidence: (0.5 + 0.1 * size as f32).min(0.95),
                    centroid: None,
                }
            })
            .collect())
    }
}
