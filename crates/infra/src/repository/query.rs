//! Pagination for read queries.
//!
//! Read queries are pass-through: they sit outside the version-gated write
//! path and exclude soft-deleted ledgers.

use serde::{Deserialize, Serialize};

/// 1-based page request.
///
/// Deserialization goes through [`Pagination::new`], so request bodies get
/// the same clamping as code-built values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawPagination")]
pub struct Pagination {
    page: u32,
    page_size: u32,
}

#[derive(Deserialize)]
struct RawPagination {
    #[serde(default)]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page_size() -> u32 {
    Pagination::DEFAULT_PAGE_SIZE
}

impl From<RawPagination> for Pagination {
    fn from(raw: RawPagination) -> Self {
        Self::new(raw.page, raw.page_size)
    }
}

impl Pagination {
    pub const DEFAULT_PAGE_SIZE: u32 = 10;
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Page numbers below 1 become 1; the size is clamped to `1..=100`.
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_PAGE_SIZE)
    }
}

/// One page of results plus totals across all pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        let page_size = u64::from(pagination.page_size().max(1));
        let total_pages = total.div_ceil(page_size);
        Self {
            items,
            total,
            page: pagination.page(),
            page_size: pagination.page_size(),
            total_pages: u32::try_from(total_pages).unwrap_or(u32::MAX),
            has_more: pagination.offset() + page_size < total,
        }
    }

    /// Slice an already filtered and ordered result set.
    pub fn from_sorted(all: Vec<T>, pagination: Pagination) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(pagination.offset() as usize)
            .take(pagination.limit() as usize)
            .collect();
        Self::new(items, total, pagination)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
            total_pages: self.total_pages,
            has_more: self.has_more,
        }
    }
}
