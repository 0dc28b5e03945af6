//! News records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A news article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub url: String,
    /// Publisher name.
    pub source: String,
    /// Leading part of the body.
    pub summary: String,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub categories: Vec<String>,
}

impl Article {
    /// Whether the article is tagged with `category` (case-insensitive).
    pub fn has_category(&self, category: &str) -> bool {
        self.categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }
}
