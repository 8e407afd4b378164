//! Level sizing and lazy-grow buffer bookkeeping shared by the engines.

use crate::ClppResult;

/// Level sizes of a multi-level block decomposition.
///
/// `levels[0] = n`, `levels[i + 1] = ceil(levels[i] / block)`, stopping
/// at the first level of at most one element. An empty dataset yields
/// `[0]`.
pub fn compute_levels(n: usize, block: usize) -> Vec<usize> {
    debug_assert!(block > 1, "block size must be > 1");
    let mut levels = vec![n];
    let mut current = n;
    while current > 1 {
        current = current.div_ceil(block);
        levels.push(current);
    }
    levels
}

/// The level structure of one dataset size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    block_size: usize,
    levels: Vec<usize>,
}

impl BlockPlan {
    pub fn new(n: usize, block_size: usize) -> Self {
        Self {
            block_size,
            levels: compute_levels(n, block_size),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Element count per level, `levels()[0]` being the dataset itself.
    pub fn levels(&self) -> &[usize] {
        &self.levels
    }

    /// Number of elements at level 0.
    pub fn len(&self) -> usize {
        self.levels[0]
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0] == 0
    }

    /// Blocks covering level 0.
    pub fn num_blocks(&self) -> usize {
        self.levels[0].div_ceil(self.block_size)
    }

    /// Number of block-scan launches needed: one per level that still
    /// has to be reduced, and at least one for any non-empty dataset.
    pub fn passes(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.levels.len() - 1).max(1)
        }
    }

    /// Length of the block-sum array written by pass `i`.
    pub fn block_sum_len(&self, i: usize) -> usize {
        self.levels[i].div_ceil(self.block_size).max(1)
    }
}

/// A set of device resources sized for a capacity that only grows.
///
/// Allocation is deferred to the first request and repeated only when a
/// request exceeds the current capacity; smaller requests reuse what is
/// there.
#[derive(Debug)]
pub struct Reservation<T> {
    capacity: usize,
    resources: Option<T>,
    allocations: usize,
}

impl<T> Default for Reservation<T> {
    fn default() -> Self {
        Self {
            capacity: 0,
            resources: None,
            allocations: 0,
        }
    }
}

impl<T> Reservation<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure the resources can hold `requested` elements.
    ///
    /// Returns `true` when a (re)allocation happened. On failure the
    /// previous resources are already released and the reservation is
    /// empty.
    pub fn allocate_or_reuse<F>(&mut self, requested: usize, alloc: F) -> ClppResult<bool>
    where
        F: FnOnce(usize) -> ClppResult<T>,
    {
        if self.resources.is_some() && requested <= self.capacity {
            return Ok(false);
        }
        // Release before allocating so peak device memory stays at one set.
        self.resources = None;
        self.capacity = 0;
        let resources = alloc(requested)?;
        log::debug!("reservation grown to {requested} elements");
        self.resources = Some(resources);
        self.capacity = requested;
        self.allocations += 1;
        Ok(true)
    }

    /// Capacity the current resources were sized for (0 when empty).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many times resources were allocated.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn get(&self) -> Option<&T> {
        self.resources.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.resources.as_mut()
    }
}

/// Owned block-sum buffers, one per scan pass, keyed by level index.
#[derive(Debug)]
pub struct LevelBuffers<B> {
    buffers: Vec<B>,
    sizes: Vec<usize>,
}

impl<B> LevelBuffers<B> {
    /// Allocate one buffer per pass of `plan`, each holding that pass's
    /// block sums.
    pub fn allocate<F>(plan: &BlockPlan, mut alloc: F) -> ClppResult<Self>
    where
        F: FnMut(usize) -> ClppResult<B>,
    {
        let passes = plan.passes();
        let mut buffers = Vec::with_capacity(passes);
        let mut sizes = Vec::with_capacity(passes);
        for i in 0..passes {
            let len = plan.block_sum_len(i);
            buffers.push(alloc(len)?);
            sizes.push(len);
        }
        Ok(Self { buffers, sizes })
    }

    /// Block-sum buffer written by pass `level`.
    pub fn get(&self, level: usize) -> Option<&B> {
        self.buffers.get(level)
    }

    /// Capacity in words of the buffer at `level`.
    pub fn size(&self, level: usize) -> usize {
        self.sizes.get(level).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// True when every pass of `plan` fits the allocated buffers.
    pub fn fits(&self, plan: &BlockPlan) -> bool {
        plan.passes() <= self.len()
            && (0..plan.passes()).all(|i| plan.block_sum_len(i) <= self.size(i))
    }
}
