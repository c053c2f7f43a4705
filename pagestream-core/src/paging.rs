//! Page pairing rules. Pure functions of (mode, total, index); no I/O.

use crate::{PageNumber, PairingMode};

/// The page or page pair shown for one anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spread {
    pub left: PageNumber,
    pub right: Option<PageNumber>,
}

impl Spread {
    pub fn single(page: PageNumber) -> Self {
        Self {
            left: page,
            right: None,
        }
    }

    pub fn last(&self) -> PageNumber {
        self.right.unwrap_or(self.left)
    }

    pub fn pages(&self) -> impl Iterator<Item = PageNumber> {
        std::iter::once(self.left).chain(self.right)
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        self.left == page || self.right == Some(page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingPolicy {
    mode: PairingMode,
    total: Option<u32>,
}

impl PagingPolicy {
    pub fn new(mode: PairingMode, total: Option<u32>) -> Self {
        Self { mode, total }
    }

    pub fn mode(&self) -> PairingMode {
        self.mode
    }

    pub fn total(&self) -> Option<u32> {
        self.total
    }

    /// Whether `page` can exist. Always true for positive pages while the
    /// total is unknown.
    pub fn contains(&self, page: PageNumber) -> bool {
        page >= 1 && self.total.map_or(true, |total| page <= total)
    }

    pub fn left_page(&self, index: PageNumber) -> PageNumber {
        let index = index.max(1);
        match self.mode {
            PairingMode::DoubleCover if index == 1 => 1,
            PairingMode::DoubleCover if index % 2 == 0 => index,
            PairingMode::DoubleCover => index - 1,
            PairingMode::Single | PairingMode::DoubleContiguous => index,
        }
    }

    pub fn right_page(&self, index: PageNumber) -> Option<PageNumber> {
        let left = self.left_page(index);
        match self.mode {
            PairingMode::Single => None,
            PairingMode::DoubleCover if left == 1 => None,
            PairingMode::DoubleContiguous | PairingMode::DoubleCover => {
                left.checked_add(1).filter(|&right| self.contains(right))
            }
        }
    }

    pub fn spread(&self, index: PageNumber) -> Spread {
        Spread {
            left: self.left_page(index),
            right: self.right_page(index),
        }
    }

    /// Anchor of the spread that contains `page`.
    pub fn align(&self, page: PageNumber) -> PageNumber {
        self.left_page(page)
    }

    fn step(&self) -> u32 {
        if self.mode.is_double() {
            2
        } else {
            1
        }
    }

    /// Returns `anchor` unchanged when the next spread would start past a
    /// known last page.
    pub fn next_anchor(&self, anchor: PageNumber) -> PageNumber {
        let left = self.left_page(anchor);
        let candidate = match self.mode {
            PairingMode::DoubleCover if left == 1 => 2,
            _ => left.saturating_add(self.step()),
        };
        if self.contains(candidate) {
            candidate
        } else {
            left
        }
    }

    pub fn previous_anchor(&self, anchor: PageNumber) -> PageNumber {
        let left = self.left_page(anchor);
        match self.mode {
            PairingMode::DoubleCover if left <= 3 => 1,
            _ => left.saturating_sub(self.step()).max(1),
        }
    }

    pub fn first_anchor(&self) -> PageNumber {
        1
    }

    /// Anchor of the final spread; `None` while the total is unknown or zero.
    pub fn last_anchor(&self) -> Option<PageNumber> {
        let total = self.total.filter(|&total| total > 0)?;
        let anchor = match self.mode {
            PairingMode::Single => total,
            PairingMode::DoubleContiguous if total % 2 == 0 => total - 1,
            PairingMode::DoubleContiguous => total,
            PairingMode::DoubleCover => self.left_page(total),
        };
        Some(anchor)
    }
}
