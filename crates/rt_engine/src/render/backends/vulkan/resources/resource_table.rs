//! Append-only, handle-indexed resource storage
//!
//! Handles are plain indices into the table's backing array. They are handed
//! out in creation order starting at zero and stay valid for the lifetime of
//! the table, which is what lets the backing array be uploaded wholesale to a
//! bindless descriptor array and indexed by the same numbers on the GPU.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Index value reserved for "no resource"
pub const NULL_RESOURCE_INDEX: u32 = u32::MAX;

/// Typed index into a [`ResourceTable<T>`]
pub struct ResourceHandle<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ResourceHandle<T> {
    pub(crate) const fn new(index: u32) -> Self {
        Self { index, _marker: PhantomData }
    }

    /// The handle denoting absence of a resource
    pub const fn null() -> Self {
        Self::new(NULL_RESOURCE_INDEX)
    }

    /// Whether this is the null handle
    pub const fn is_null(self) -> bool {
        self.index == NULL_RESOURCE_INDEX
    }

    /// Raw index, as seen by shaders
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl<T> Default for ResourceHandle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResourceHandle<T> {}

impl<T> PartialEq for ResourceHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for ResourceHandle<T> {}

impl<T> Hash for ResourceHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ResourceHandle(null)")
        } else {
            write!(f, "ResourceHandle({})", self.index)
        }
    }
}

/// Append-only storage addressed by [`ResourceHandle`]
#[derive(Debug)]
pub struct ResourceTable<T> {
    resources: Vec<T>,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceTable<T> {
    /// Create an empty table
    pub const fn new() -> Self {
        Self { resources: Vec::new() }
    }

    /// Store a resource and return its handle
    ///
    /// # Panics
    ///
    /// Panics if the table already holds `u32::MAX` resources.
    pub fn create(&mut self, resource: T) -> ResourceHandle<T> {
        let index = u32::try_from(self.resources.len())
            .ok()
            .filter(|&index| index != NULL_RESOURCE_INDEX)
            .expect("resource table exhausted the u32 index space");
        self.resources.push(resource);
        ResourceHandle::new(index)
    }

    /// Look up a resource; `None` for null or out-of-range handles
    pub fn get(&self, handle: ResourceHandle<T>) -> Option<&T> {
        self.resources.get(handle.index as usize)
    }

    /// All resources in handle order
    pub fn get_all(&self) -> &[T] {
        &self.resources
    }

    /// Number of stored resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterate over `(handle, resource)` pairs in creation order
    pub fn iter(&self) -> impl Iterator<Item = (ResourceHandle<T>, &T)> {
        (0u32..).zip(self.resources.iter()).map(|(index, resource)| (ResourceHandle::new(index), resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_assigned_in_creation_order() {
        let mut table = ResourceTable::new();
        let handles: Vec<_> = ["a", "b", "c"].into_iter().map(|name| table.create(name)).collect();

        assert_eq!(handles.iter().map(|h| h.index()).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(table.get(handles[1]), Some(&"b"));
        assert_eq!(table.get_all(), &["a", "b", "c"]);
    }

    #[test]
    fn test_handles_stay_valid_as_table_grows() {
        let mut table = ResourceTable::new();
        let first = table.create(10);
        for value in 0..100 {
            table.create(value);
        }
        assert_eq!(table.get(first), Some(&10));
        assert_eq!(table.len(), 101);
    }

    #[test]
    fn test_null_and_out_of_range_lookups_fail() {
        let mut table = ResourceTable::new();
        table.create(1.0_f32);

        assert!(table.get(ResourceHandle::null()).is_none());
        assert!(table.get(ResourceHandle::new(5)).is_none());
    }

    #[test]
    fn test_default_handle_is_null() {
        let handle: ResourceHandle<u8> = ResourceHandle::default();
        assert!(handle.is_null());
        assert_eq!(handle.index(), NULL_RESOURCE_INDEX);
        assert_eq!(format!("{handle:?}"), "ResourceHandle(null)");
    }

    #[test]
    fn test_iter_pairs_handles_with_values() {
        let mut table = ResourceTable::new();
        table.create('x');
        table.create('y');

        let pairs: Vec<_> = table.iter().map(|(h, v)| (h.index(), *v)).collect();
        assert_eq!(pairs, vec![(0, 'x'), (1, 'y')]);
    }
}
