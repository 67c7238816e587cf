use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    ops::Index,
};

/// A type-safe identifier for elements stored in an [`Arena`].
///
/// Uses phantom data to ensure type safety - an `ArenaId<A>` cannot be used
/// to access elements from an `Arena<B>`.
pub struct ArenaId<T> {
    id: u32,
    _phantom_data: PhantomData<T>,
}

// Manual impls: ids are just indexes, so none of these should require
// anything of `T`.
impl<T> Copy for ArenaId<T> {}

impl<T> Clone for ArenaId<T> {
    #[inline(always)]
    fn clone(&self) -> ArenaId<T> {
        *self
    }
}

impl<T> fmt::Debug for ArenaId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaId({})", self.id)
    }
}

impl<T> PartialEq for ArenaId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ArenaId<T> {}

impl<T> PartialOrd for ArenaId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ArenaId<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> Hash for ArenaId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> From<u32> for ArenaId<T> {
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

impl<T> From<usize> for ArenaId<T> {
    fn from(id: usize) -> Self {
        Self::new(id as u32)
    }
}

impl<T> ArenaId<T> {
    /// Creates a new arena identifier from a raw `u32` index.
    pub const fn new(id: u32) -> ArenaId<T> {
        Self {
            id,
            _phantom_data: PhantomData,
        }
    }

    pub const fn index(&self) -> usize {
        self.id as usize
    }
}

/// An arena allocator for efficiently storing and accessing elements.
///
/// The arena allocates elements sequentially and returns type-safe [`ArenaId`]s
/// that can be used to retrieve elements later. An element's identity is its
/// index, so two ids are the same element exactly when they are equal.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena { items: Vec::new() }
    }
}

impl<T> Arena<T> {
    /// Creates a new arena with the specified initial capacity.
    pub fn new(size: usize) -> Self {
        Arena {
            items: Vec::with_capacity(size),
        }
    }

    /// Allocates a value in the arena and returns its identifier.
    pub fn alloc(&mut self, value: T) -> ArenaId<T> {
        let arena_id = self.items.len() as u32;
        self.items.push(value);
        ArenaId::new(arena_id)
    }

    /// Returns the number of elements in the arena.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the arena contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a reference to the element at the given `ArenaId`, or `None` if out of bounds.
    pub fn get(&self, id: ArenaId<T>) -> Option<&T> {
        self.items.get(id.id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaId<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (ArenaId::new(i as u32), item))
    }
}

impl<T> Index<ArenaId<T>> for Arena<T> {
    type Output = T;

    fn index(&self, index: ArenaId<T>) -> &Self::Output {
        &self.items[index.id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn filled(values: &[&str]) -> (Arena<String>, Vec<ArenaId<String>>) {
        let mut arena = Arena::new(values.len());
        let ids = values.iter().map(|v| arena.alloc(v.to_string())).collect();
        (arena, ids)
    }

    #[rstest]
    #[case(&["if", "then", "else"], 1, "then")]
    #[case(&["lone"], 0, "lone")]
    fn test_get(#[case] values: &[&str], #[case] index: u32, #[case] expected: &str) {
        let (arena, ids) = filled(values);
        assert_eq!(arena[ids[index as usize]], expected);
        assert_eq!(arena.get(ArenaId::new(index)).map(String::as_str), Some(expected));
    }

    #[rstest]
    #[case(&["a", "b"], 2, false)]
    #[case(&[], 0, true)]
    fn test_len(#[case] values: &[&str], #[case] len: usize, #[case] empty: bool) {
        let (arena, _) = filled(values);
        assert_eq!(arena.len(), len);
        assert_eq!(arena.is_empty(), empty);
    }

    #[test]
    fn test_ids_are_identity() {
        let mut arena = Arena::new(2);
        let a = arena.alloc("x");
        let b = arena.alloc("x");
        assert_ne!(a, b);
        assert_eq!(a, ArenaId::from(0u32));
        assert_eq!(arena.get(ArenaId::new(5)), None);
    }

    #[test]
    fn test_ids_need_nothing_of_the_element_type() {
        // Elements that are neither Eq, Hash nor Default; ids must still be
        // comparable, hashable map keys, and the arena still has a Default.
        struct Opaque(#[allow(dead_code)] f64);

        let mut arena = Arena::<Opaque>::default();
        let a = arena.alloc(Opaque(1.0));
        let b = arena.alloc(Opaque(2.0));

        let mut slots = rustc_hash::FxHashMap::default();
        slots.insert(a, 10u16);
        slots.insert(b, 20u16);
        assert_eq!(slots.get(&a), Some(&10));
        assert!(a < b);
        assert_eq!(format!("{a:?}"), "ArenaId(0)");
    }
}
