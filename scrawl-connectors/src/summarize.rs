//! Summarizer contract and the built-in theme summarizer

use crate::entities::{
    Cluster, Note, Project, ProjectSummary, Quote, SummaryOptions, Theme,
};
use crate::error::ConnectorResult;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;

/// Produces a project summary from clusters and their notes
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        project: &Project,
        clusters: &[Cluster],
        notes: &[Note],
        options: &SummaryOptions,
    ) -> ConnectorResult<ProjectSummary>;
}

/// Deterministic summarizer ranking themes by cluster size
pub struct ThemeSummarizer;

impl ThemeSummarizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ThemeSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for ThemeSummarizer {
    async fn summarize(
        &self,
        project: &Project,
        clusters: &[Cluster],
        notes: &[Note],
        options: &SummaryOptions,
    ) -> ConnectorResult<ProjectSummary> {
        let total_notes = notes.len().max(1);

        let mut ranked: Vec<&Cluster> = clusters.iter().collect();
        ranked.sort_by(|a, b| {
            b.member_ids
                .len()
                .cmp(&a.member_ids.len())
                .then_with(|| a.label.cmp(&b.label))
        });

        let mut top_themes = Vec::new();
        let mut distribution = BTreeMap::new();
        let mut representative_quotes = Vec::new();

        for cluster in ranked {
            let percentage = cluster.member_ids.len() as f32 * 100.0 / total_notes as f32;
            if percentage < options.min_theme_percentage {
                continue;
            }
            if top_themes.len() < options.max_themes {
                top_themes.push(Theme {
                    label: cluster.label.clone(),
                    percentage,
                    note_count: cluster.member_ids.len(),
                });
                if options.include_quotes {
                    // Longest member text reads best as a quote
                    if let Some(quote) = cluster
                        .member_ids
                        .iter()
                        .filter_map(|id| notes.iter().find(|n| n.id == *id))
                        .map(|n| n.cleaned_text.as_deref().unwrap_or(&n.text))
                        .max_by_key(|t| t.len())
                    {
                        representative_quotes.push(Quote {
                            theme: cluster.label.clone(),
                            text: quote.to_string(),
                        });
                    }
                }
            }
            if options.include_distribution {
                distribution.insert(cluster.label.clone(), percentage);
            }
        }

        let insights = top_themes
            .iter()
            .take(3)
            .map(|t| {
                format!(
                    "{} of {} notes ({:.0}%) concern \"{}\"",
                    t.note_count, total_notes, t.percentage, t.label
                )
            })
            .collect();

        Ok(ProjectSummary {
            project_id: project.id.clone(),
            top_themes,
            distribution,
            representative_quotes,
            insights,
            generated_at: Utc::now(),
        })
    }
}
