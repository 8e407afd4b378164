//! Shared abstractions for the engines, independent of the backend.

/// Ping-pong pair of buffers.
///
/// One slot is the *current* source of a pass, the other its
/// destination. After each pass the roles are exchanged with
/// [`swap`](DoubleBuffer::swap), so the freshest data is always in
/// [`current`](DoubleBuffer::current).
#[derive(Debug)]
pub struct DoubleBuffer<B> {
    slots: [B; 2],
    active: usize,
}

impl<B> DoubleBuffer<B> {
    /// Create a pair with `first` as the current side.
    pub fn new(first: B, second: B) -> Self {
        Self {
            slots: [first, second],
            active: 0,
        }
    }

    /// Side holding the latest data.
    pub fn current(&self) -> &B {
        &self.slots[self.active]
    }

    pub fn current_mut(&mut self) -> &mut B {
        &mut self.slots[self.active]
    }

    /// Side the next pass writes to.
    pub fn alternate(&self) -> &B {
        &self.slots[1 - self.active]
    }

    /// `(source, destination)` for the next pass.
    pub fn pair(&self) -> (&B, &B) {
        (&self.slots[self.active], &self.slots[1 - self.active])
    }

    /// Exchange the roles of the two sides.
    pub fn swap(&mut self) {
        self.active = 1 - self.active;
    }

    /// Make slot 0 current again, e.g. before uploading a new dataset.
    pub fn reset(&mut self) {
        self.active = 0;
    }

    /// Index of the current slot (0 or 1).
    pub fn active_index(&self) -> usize {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_buffer_swap_alternates() {
        let mut db = DoubleBuffer::new("a", "b");
        assert_eq!(*db.current(), "a");
        assert_eq!(*db.alternate(), "b");
        db.swap();
        assert_eq!(*db.current(), "b");
        assert_eq!(*db.alternate(), "a");
        // Wraps around
        db.swap();
        assert_eq!(*db.current(), "a");
    }

    #[test]
    fn test_double_buffer_pair_matches_roles() {
        let mut db = DoubleBuffer::new(10, 20);
        db.swap();
        let (src, dst) = db.pair();
        assert_eq!((*src, *dst), (20, 10));
        assert_eq!(db.active_index(), 1);
    }

    #[test]
    fn test_double_buffer_reset() {
        let mut db = DoubleBuffer::new(vec![1u32], vec![2u32]);
        db.swap();
        db.current_mut().push(3);
        assert_eq!(db.current(), &vec![2, 3]);
        db.reset();
        assert_eq!(db.current(), &vec![1]);
        assert_eq!(db.active_index(), 0);
    }
}
