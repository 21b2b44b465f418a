//! Resumable progress of one collection run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a restart does with listings recorded in an unfinished checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Skip listings already processed by the interrupted run
    #[default]
    SkipProcessed,
    /// Re-fetch every listing; progress is still recorded
    Revalidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestCheckpoint {
    pub site: String,
    pub collection_key: String,
    /// Last list page whose items were all handled (0 = none)
    pub last_completed_page: u32,
    pub processed_ids: BTreeSet<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl HarvestCheckpoint {
    pub fn new(site: impl Into<String>, collection_key: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            collection_key: collection_key.into(),
            last_completed_page: 0,
            processed_ids: BTreeSet::new(),
            updated_at: None,
        }
    }

    pub fn is_processed(&self, natural_id: &str) -> bool {
        self.processed_ids.contains(natural_id)
    }

    pub fn mark_processed(&mut self, natural_id: impl Into<String>) {
        self.processed_ids.insert(natural_id.into());
    }

    /// Never moves backwards
    pub fn complete_page(&mut self, page: u32) {
        self.last_completed_page = self.last_completed_page.max(page);
    }

    pub fn is_fresh(&self) -> bool {
        self.last_completed_page == 0 && self.processed_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_page_is_monotonic() {
        let mut checkpoint = HarvestCheckpoint::new("ctrip", "shenzhen");
        assert!(checkpoint.is_fresh());
        checkpoint.complete_page(3);
        checkpoint.complete_page(2);
        assert_eq!(checkpoint.last_completed_page, 3);
    }

    #[test]
    fn processed_ids_are_tracked() {
        let mut checkpoint = HarvestCheckpoint::new("qunar", "beijing");
        checkpoint.mark_processed("h-9");
        assert!(checkpoint.is_processed("h-9"));
        assert!(!checkpoint.is_processed("h-10"));
        assert!(!checkpoint.is_fresh());
    }
}
