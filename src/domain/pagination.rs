//! Pagination domain logic centralization.
//!
//! Responsibility:
//! - resource kinds walked page by page (list, comments, Q&A) plus detail
//! - page count from a reported item total (ceiling division)
//! - expected item count of a given page

use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource families a site exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    List,
    Detail,
    Comments,
    Qa,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Detail => "detail",
            Self::Comments => "comments",
            Self::Qa => "qa",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient description of one page fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub kind: ResourceKind,
    /// Collection key for list pages, listing id otherwise
    pub item_key: String,
    /// 1-based
    pub page_index: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationCalculator {
    page_size: u32,
}

impl PaginationCalculator {
    /// A zero page size is treated as one item per page
    pub const fn new(page_size: u32) -> Self {
        Self {
            page_size: if page_size == 0 { 1 } else { page_size },
        }
    }

    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// ceil(total / page_size), saturating at `u32::MAX`
    pub fn total_pages(&self, total_items: u64) -> u32 {
        let pages = total_items.div_ceil(u64::from(self.page_size));
        u32::try_from(pages).unwrap_or(u32::MAX)
    }

    /// Items expected on 1-based `page`; 0 outside the walked range
    pub fn items_on_page(&self, total_items: u64, page: u32) -> u64 {
        let total_pages = self.total_pages(total_items);
        if page == 0 || page > total_pages {
            return 0;
        }
        let size = u64::from(self.page_size);
        let before = u64::from(page - 1) * size;
        (total_items - before).min(size)
    }
}
