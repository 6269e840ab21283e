use crate::error::{ExpensortError, Result};

/// Half-open slice `[base, end)` of the exemplar list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub index: usize,
    pub base: usize,
    pub end: usize,
}

impl Page {
    pub fn len(&self) -> usize {
        self.end - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.base
    }
}

pub fn paginate(n: usize, page_size: usize) -> Result<Vec<Page>> {
    if page_size == 0 {
        return Err(ExpensortError::InvalidArgument(
            "page_size must be a positive integer".to_string(),
        ));
    }
    let pages = (0..n.div_ceil(page_size))
        .map(|index| {
            let base = index * page_size;
            Page {
                index,
                base,
                end: (base + page_size).min(n),
            }
        })
        .collect();
    Ok(pages)
}
