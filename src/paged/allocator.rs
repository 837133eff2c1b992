use crate::error::{CombError, Result};
use crate::paged::PageId;

/// Page allocation contract shared by the engine allocator and the
/// transaction-scoped view.
pub trait Allocator {
    /// Allocates `count` contiguous pages, returning the first.
    fn alloc(&mut self, count: u32) -> Result<PageId>;
    /// Frees `count` contiguous pages starting at `page`. Freeing a page
    /// that is already free is a contract violation.
    fn free(&mut self, page: PageId, count: u32) -> Result<()>;
    /// Marks a currently-free range as allocated.
    fn unfree(&mut self, page: PageId, count: u32) -> Result<()>;
    /// Resets the allocator to fully free.
    fn clear(&mut self) -> Result<()>;
    /// Capacity in pages.
    fn limit(&self) -> u64;
    fn is_allocated(&self, page: PageId) -> bool;
}

/// A contiguous run of pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    pub start: u64,
    pub len: u64,
}

impl Extent {
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.end() == other.start {
            self.len += other.len;
            true
        } else {
            false
        }
    }

    fn contains(&self, start: u64, len: u64) -> bool {
        start >= self.start && start + len <= self.end()
    }

    fn overlaps(&self, start: u64, len: u64) -> bool {
        start < self.end() && self.start < start + len
    }
}

/// First-fit extent allocator over the page range `[base, base + limit)`.
///
/// The free set is kept as a sorted, coalesced extent list; the same list
/// is what the engine persists at commit.
#[derive(Clone, Debug)]
pub struct ExtentAllocator {
    base: u64,
    limit: u64,
    free: Vec<Extent>,
}

impl ExtentAllocator {
    pub fn new(base: u64, limit: u64) -> Self {
        let free = if limit > 0 {
            vec![Extent::new(base, limit)]
        } else {
            Vec::new()
        };
        Self { base, limit, free }
    }

    /// Rebuilds an allocator from a persisted free-extent list.
    pub fn from_free_extents(base: u64, limit: u64, extents: Vec<Extent>) -> Result<Self> {
        let mut alloc = Self {
            base,
            limit,
            free: extents,
        };
        alloc.free.sort_by_key(|e| e.start);
        for pair in alloc.free.windows(2) {
            if pair[0].end() > pair[1].start {
                return Err(CombError::Corruption("free extents overlap"));
            }
        }
        if let (Some(first), Some(last)) = (alloc.free.first(), alloc.free.last()) {
            if first.start < base || last.end() > base + limit {
                return Err(CombError::Corruption("free extent out of range"));
            }
        }
        alloc.coalesce();
        Ok(alloc)
    }

    pub fn free_extents(&self) -> &[Extent] {
        &self.free
    }

    pub fn free_page_count(&self) -> u64 {
        self.free.iter().map(|e| e.len).sum()
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<Extent> = Vec::with_capacity(self.free.len());
        for extent in self.free.drain(..) {
            if extent.len == 0 {
                continue;
            }
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.free = merged;
    }

    fn in_range(&self, start: u64, len: u64) -> bool {
        start >= self.base && start + len <= self.base + self.limit
    }
}

impl Allocator for ExtentAllocator {
    fn alloc(&mut self, count: u32) -> Result<PageId> {
        if count == 0 {
            return Err(CombError::Invalid("allocation of zero pages"));
        }
        let count = count as u64;
        let pos = self
            .free
            .iter()
            .position(|e| e.len >= count)
            .ok_or(CombError::OutOfSpace)?;
        let extent = &mut self.free[pos];
        let page = extent.start;
        extent.start += count;
        extent.len -= count;
        if extent.len == 0 {
            self.free.remove(pos);
        }
        Ok(PageId(page))
    }

    fn free(&mut self, page: PageId, count: u32) -> Result<()> {
        if count == 0 {
            return Err(CombError::Invalid("free of zero pages"));
        }
        let (start, len) = (page.0, count as u64);
        if !self.in_range(start, len) {
            return Err(CombError::Paging("free outside the allocator range"));
        }
        if self.free.iter().any(|e| e.overlaps(start, len)) {
            return Err(CombError::Paging("free of a page that is already free"));
        }
        let pos = self.free.partition_point(|e| e.start < start);
        self.free.insert(pos, Extent::new(start, len));
        self.coalesce();
        Ok(())
    }

    fn unfree(&mut self, page: PageId, count: u32) -> Result<()> {
        if count == 0 {
            return Err(CombError::Invalid("unfree of zero pages"));
        }
        let (start, len) = (page.0, count as u64);
        let pos = self
            .free
            .iter()
            .position(|e| e.contains(start, len))
            .ok_or(CombError::Paging("unfree of an allocated page"))?;
        let extent = self.free[pos];
        self.free.remove(pos);
        if extent.start < start {
            let lead = Extent::new(extent.start, start - extent.start);
            self.free.insert(pos, lead);
        }
        if start + len < extent.end() {
            let tail = Extent::new(start + len, extent.end() - (start + len));
            let at = self.free.partition_point(|e| e.start < tail.start);
            self.free.insert(at, tail);
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.free = if self.limit > 0 {
            vec![Extent::new(self.base, self.limit)]
        } else {
            Vec::new()
        };
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn is_allocated(&self, page: PageId) -> bool {
        self.in_range(page.0, 1) && !self.free.iter().any(|e| e.contains(page.0, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_first_fit_and_contiguous() {
        let mut alloc = ExtentAllocator::new(0, 16);
        assert_eq!(alloc.alloc(4).unwrap(), PageId(0));
        assert_eq!(alloc.alloc(2).unwrap(), PageId(4));
        alloc.free(PageId(0), 4).unwrap();
        // A four-page hole exists at the front; a three-page request fits it.
        assert_eq!(alloc.alloc(3).unwrap(), PageId(0));
        // A five-page request must skip past the in-use extent.
        assert_eq!(alloc.alloc(5).unwrap(), PageId(6));
    }

    #[test]
    fn full_capacity_alloc_succeeds_and_overflow_fails() {
        let mut alloc = ExtentAllocator::new(0, 8);
        let limit = alloc.limit() as u32;
        assert_eq!(alloc.alloc(limit).unwrap(), PageId(0));
        alloc.free(PageId(0), limit).unwrap();
        assert!(matches!(
            alloc.alloc(limit + 1),
            Err(CombError::OutOfSpace)
        ));
    }

    #[test]
    fn double_free_is_a_paging_error() {
        let mut alloc = ExtentAllocator::new(0, 8);
        let page = alloc.alloc(2).unwrap();
        alloc.free(page, 2).unwrap();
        let err = alloc.free(page, 2).unwrap_err();
        assert!(err.is_paging());
    }

    #[test]
    fn free_coalesces_neighbors() {
        let mut alloc = ExtentAllocator::new(0, 8);
        let a = alloc.alloc(2).unwrap();
        let b = alloc.alloc(2).unwrap();
        let c = alloc.alloc(2).unwrap();
        alloc.free(a, 2).unwrap();
        alloc.free(c, 2).unwrap();
        alloc.free(b, 2).unwrap();
        assert_eq!(alloc.free_extents(), &[Extent::new(0, 8)]);
    }

    #[test]
    fn unfree_carves_out_of_a_free_extent() {
        let mut alloc = ExtentAllocator::new(0, 8);
        alloc.unfree(PageId(2), 3).unwrap();
        assert!(alloc.is_allocated(PageId(2)));
        assert!(alloc.is_allocated(PageId(4)));
        assert!(!alloc.is_allocated(PageId(5)));
        assert_eq!(
            alloc.free_extents(),
            &[Extent::new(0, 2), Extent::new(5, 3)]
        );
        assert!(alloc.unfree(PageId(2), 1).unwrap_err().is_paging());
    }

    #[test]
    fn persisted_extents_roundtrip() {
        let mut alloc = ExtentAllocator::new(2, 14);
        let a = alloc.alloc(3).unwrap();
        let _b = alloc.alloc(3).unwrap();
        alloc.free(a, 3).unwrap();
        let rebuilt =
            ExtentAllocator::from_free_extents(2, 14, alloc.free_extents().to_vec()).unwrap();
        assert_eq!(rebuilt.free_extents(), alloc.free_extents());
        assert_eq!(rebuilt.free_page_count(), alloc.free_page_count());
    }

    #[test]
    fn is_allocated_tracks_state() {
        let mut alloc = ExtentAllocator::new(0, 4);
        assert!(!alloc.is_allocated(PageId(0)));
        let page = alloc.alloc(1).unwrap();
        assert!(alloc.is_allocated(page));
        assert!(!alloc.is_allocated(PageId(99)));
    }
}
