//! Page requests and page results.

use serde::Serialize;

use crate::transaction::{TransactionError, TransactionResult};

/// Which page to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: usize,
    pub per_page: usize,
    /// Reject invalid or out-of-range requests instead of correcting them.
    pub error_out: bool,
    pub max_per_page: Option<usize>,
    /// Run a count query. Without it, `per_page + 1` rows are fetched to
    /// tell whether a next page exists and totals stay unknown.
    pub count: bool,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
            error_out: false,
            max_per_page: None,
            count: true,
        }
    }
}

impl PageRequest {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self {
            page,
            per_page,
            ..Default::default()
        }
    }

    pub fn error_out(mut self, value: bool) -> Self {
        self.error_out = value;
        self
    }

    pub fn max_per_page(mut self, max: usize) -> Self {
        self.max_per_page = Some(max);
        self
    }

    pub fn count(mut self, value: bool) -> Self {
        self.count = value;
        self
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    /// `None` when counting was skipped.
    pub total: Option<usize>,
    /// 0 when counting was skipped.
    pub pages: usize,
    pub has_prev: bool,
    pub has_next: bool,
    pub prev_num: Option<usize>,
    pub next_num: Option<usize>,
}

/// Run `request` against a source that can count and fetch windows
/// (`fetch(offset, limit)`).
pub(crate) fn paginate<T, C, F>(
    request: PageRequest,
    count: C,
    fetch: F,
) -> TransactionResult<Page<T>>
where
    C: FnOnce() -> TransactionResult<usize>,
    F: FnOnce(usize, usize) -> TransactionResult<Vec<T>>,
{
    let mut per_page = request.per_page;
    if let Some(max) = request.max_per_page {
        per_page = per_page.min(max);
    }

    let mut page = request.page;
    if page < 1 {
        if request.error_out {
            return Err(TransactionError::InvalidArgument("page must be >= 1".into()));
        }
        page = 1;
    }
    if per_page < 1 {
        if request.error_out {
            return Err(TransactionError::InvalidArgument(
                "per_page must be >= 1".into(),
            ));
        }
        per_page = 20;
    }

    // a window past usize::MAX holds nothing
    let offset = match (page - 1).checked_mul(per_page) {
        Some(offset) => Some(offset),
        None if request.error_out => {
            return Err(TransactionError::InvalidArgument(
                "page is out of range".into(),
            ));
        }
        None => None,
    };
    let has_prev = page > 1;
    let prev_num = has_prev.then(|| page - 1);

    if request.count {
        let total = count()?;
        let pages = total.div_ceil(per_page);
        if request.error_out && total > 0 && page > pages {
            return Err(TransactionError::InvalidArgument(
                "page is out of range".into(),
            ));
        }
        let items = match offset {
            Some(offset) => fetch(offset, per_page)?,
            None => Vec::new(),
        };
        let has_next = page < pages;
        return Ok(Page {
            items,
            page,
            per_page,
            total: Some(total),
            pages,
            has_prev,
            has_next,
            prev_num,
            next_num: has_next.then(|| page + 1),
        });
    }

    let mut items = match offset {
        Some(offset) => fetch(offset, per_page.saturating_add(1))?,
        None => Vec::new(),
    };
    let has_next = items.len() > per_page;
    items.truncate(per_page);
    Ok(Page {
        items,
        page,
        per_page,
        total: None,
        pages: 0,
        has_prev,
        has_next,
        prev_num,
        next_num: has_next.then(|| page.checked_add(1)).flatten(),
    })
}
