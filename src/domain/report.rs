use serde::Serialize;

/// Totals of one collection run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    /// Listings taken through the per-item pipeline (skipped ones excluded)
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Listings skipped because an unfinished checkpoint already covered them
    pub skipped: u32,
    pub comments_saved: u64,
    /// Sum of the comment totals reported by the site
    pub comments_total: u64,
    pub qa_saved: u64,
    pub cancelled: bool,
}

impl CollectionReport {
    pub fn merge(&mut self, other: &Self) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.comments_saved += other.comments_saved;
        self.comments_total += other.comments_total;
        self.qa_saved += other.qa_saved;
        self.cancelled |= other.cancelled;
    }
}
