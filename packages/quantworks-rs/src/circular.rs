use core::fmt;

/// Append-only ring storage, optionally capped (overwrite-oldest when full).
///
/// - `capacity == None` grows without bound.
/// - Storage grows lazily up to the cap, so `T` needs no `Default`.
/// - Index 0 is always the oldest retained element.
#[derive(Clone)]
pub struct CircularColumn<T> {
    capacity: Option<usize>,
    head: usize, // next write index once full
    data: Vec<T>,
}

impl<T> fmt::Debug for CircularColumn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularColumn")
            .field("capacity", &self.capacity)
            .field("len", &self.data.len())
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

impl<T> CircularColumn<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        assert!(capacity != Some(0), "capacity must be > 0");
        Self {
            capacity,
            head: 0,
            data: Vec::with_capacity(capacity.unwrap_or(0).min(4096)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.capacity == Some(self.data.len())
    }

    #[inline]
    fn idx_from_oldest(&self, i: usize) -> usize {
        debug_assert!(i < self.data.len());
        match self.capacity {
            Some(cap) if self.data.len() == cap => (self.head + i) % cap,
            _ => i,
        }
    }

    /// Pushes a new element, returning the evicted oldest one when full.
    #[inline]
    pub fn push(&mut self, v: T) -> Option<T> {
        match self.capacity {
            Some(cap) if self.data.len() == cap => {
                let old = std::mem::replace(&mut self.data[self.head], v);
                self.head = (self.head + 1) % cap;
                Some(old)
            }
            _ => {
                self.data.push(v);
                None
            }
        }
    }

    /// Gets element by index from oldest (0 = oldest).
    #[inline]
    pub fn get(&self, i: usize) -> Option<&T> {
        if i >= self.data.len() {
            return None;
        }
        Some(&self.data[self.idx_from_oldest(i)])
    }

    /// Gets element by index from newest (0 = newest).
    #[inline]
    pub fn get_from_end(&self, i: usize) -> Option<&T> {
        let n = self.data.len();
        if i >= n {
            return None;
        }
        self.get(n - 1 - i)
    }

    #[inline]
    pub fn last(&self) -> Option<&T> {
        self.get_from_end(0)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { col: self, i: 0 }
    }
}

impl<T: Clone> CircularColumn<T> {
    pub fn to_vec_ordered(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

pub struct Iter<'a, T> {
    col: &'a CircularColumn<T>,
    i: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;
    fn next(&mut self) -> Option<Self::Item> {
        let v = self.col.get(self.i)?;
        self.i += 1;
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.col.len().saturating_sub(self.i);
        (rest, Some(rest))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
