//! Page-number pagination.

use super::backend::Window;
use snafu::Snafu;
use std::ops::Range;

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum PaginationError {
    #[snafu(display("Page size can not be negative"))]
    NegativeSize,

    #[snafu(display("Page size must not exceed the server's maximum: {max}"))]
    SizeTooLarge { max: usize },

    #[snafu(display("Page number can not be negative"))]
    NegativeNumber,

    #[snafu(display("Page number must be a positive integer"))]
    ZeroNumber,

    #[snafu(display("Page number can not be used with page size 0"))]
    NumberWithoutSize,

    #[snafu(display("{param} must be an integer, got {value}"))]
    NotAnInteger { param: String, value: String },
}

/// A validated request for one page of a collection.
///
/// A page size of 0 disables pagination: the whole collection is returned as a single page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    size: usize,
    number: usize,
}

impl PageRequest {
    /// Validate a client's page request against the server's maximum page size.
    pub fn new(size: i64, number: i64, max_size: usize) -> Result<Self, PaginationError> {
        let size = usize::try_from(size).map_err(|_| PaginationError::NegativeSize)?;
        if size > max_size {
            return Err(PaginationError::SizeTooLarge { max: max_size });
        }
        let number = usize::try_from(number).map_err(|_| PaginationError::NegativeNumber)?;
        if size == 0 && number > 1 {
            return Err(PaginationError::NumberWithoutSize);
        }
        if size > 0 && number == 0 {
            return Err(PaginationError::ZeroNumber);
        }
        Ok(Self {
            size,
            number: number.max(1),
        })
    }

    /// A request for everything, without pagination.
    pub fn unpaginated() -> Self {
        Self { size: 0, number: 1 }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn is_paginated(&self) -> bool {
        self.size > 0
    }

    /// The slice of the collection to load from the backend, if pagination is enabled.
    pub fn window(&self) -> Option<Window> {
        self.is_paginated().then(|| Window {
            offset: (self.number - 1).saturating_mul(self.size),
            limit: self.size,
        })
    }
}

/// Pagination metadata for one page of a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageResult {
    pub number: usize,
    pub size: usize,
    /// The number of items in the whole collection.
    pub total: usize,
    pub first: Option<usize>,
    pub last: Option<usize>,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl PageResult {
    /// The indices of the items on this page, clamped to the collection.
    pub fn range(&self) -> Range<usize> {
        if self.size == 0 {
            return 0..self.total;
        }
        let start = (self.number - 1).saturating_mul(self.size).min(self.total);
        let end = start.saturating_add(self.size).min(self.total);
        start..end
    }

    /// The page links which exist, by name.
    pub fn links(&self) -> impl Iterator<Item = (&'static str, Option<usize>)> {
        [
            ("first", self.first),
            ("last", self.last),
            ("prev", self.prev),
            ("next", self.next),
        ]
        .into_iter()
    }
}

/// Compute the pagination metadata for a page of a collection with `total` items.
pub fn paginate(total: usize, req: &PageRequest) -> PageResult {
    if !req.is_paginated() {
        return PageResult {
            number: 1,
            size: 0,
            total,
            first: None,
            last: None,
            prev: None,
            next: None,
        };
    }

    let last = if total == 0 {
        1
    } else {
        (total + req.size - 1) / req.size
    };
    PageResult {
        number: req.number,
        size: req.size,
        total,
        first: Some(1),
        last: Some(last),
        prev: (req.number > 1).then(|| req.number - 1),
        next: (req.number < last).then(|| req.number + 1),
    }
}
