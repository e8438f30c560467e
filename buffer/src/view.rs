//! Bounded views over discontiguous extents of a [crate::ByteBuffer].
//!
//! A view never outlives the borrow that produced it, so an extent cannot be
//! observed after the buffer has been drained or appended to.

use crate::Error;
use std::io::IoSlice;

/// Read-only view over one or more contiguous extents.
///
/// An empty view (no extents) is a valid, inert value.
#[derive(Clone, Debug, Default)]
pub struct ScatterGather<'a> {
    extents: Vec<&'a [u8]>,
}

impl<'a> ScatterGather<'a> {
    pub(crate) fn new(extents: Vec<&'a [u8]>) -> Self {
        Self { extents }
    }

    /// Number of extents in the view.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Returns true if the view has no extents.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Returns the extent at `index`.
    pub fn get(&self, index: usize) -> Result<&'a [u8], Error> {
        self.extents
            .get(index)
            .copied()
            .ok_or(Error::OutOfRange {
                index,
                count: self.extents.len(),
            })
    }

    /// Iterate over the extents in order.
    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.extents.iter().copied()
    }

    /// Total number of bytes covered by the view.
    pub fn total_len(&self) -> usize {
        self.extents.iter().map(|extent| extent.len()).sum()
    }

    /// Extents as [IoSlice]s, suitable for a vectored write.
    pub fn io_slices(&self) -> Vec<IoSlice<'a>> {
        self.extents.iter().map(|extent| IoSlice::new(extent)).collect()
    }
}

/// Writable view over space reserved (but not yet committed) in a buffer.
#[derive(Debug, Default)]
pub struct ScatterGatherMut<'a> {
    extents: Vec<&'a mut [u8]>,
}

impl<'a> ScatterGatherMut<'a> {
    pub(crate) fn new(extents: Vec<&'a mut [u8]>) -> Self {
        Self { extents }
    }

    /// Number of extents in the view.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Returns true if the view has no extents.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Returns the extent at `index` for writing.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut [u8], Error> {
        let count = self.extents.len();
        self.extents
            .get_mut(index)
            .map(|extent| &mut **extent)
            .ok_or(Error::OutOfRange { index, count })
    }

    /// Iterate over the extents in order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut [u8]> + use<'_, 'a> {
        self.extents.iter_mut().map(|extent| &mut **extent)
    }

    /// Total number of bytes that can be written through the view.
    pub fn total_len(&self) -> usize {
        self.extents.iter().map(|extent| extent.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_empty_view_is_inert() {
        let view = ScatterGather::default();
        assert!(view.is_empty());
        assert_eq!(view.total_len(), 0);
        assert_eq!(view.iter().count(), 0);
        assert!(matches!(
            view.get(0),
            Err(Error::OutOfRange { index: 0, count: 0 })
        ));
    }

    #[test_traced]
    fn test_get_out_of_range() {
        let first = b"hello".as_slice();
        let second = b" world".as_slice();
        let view = ScatterGather::new(vec![first, second]);
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(1).unwrap(), b" world");
        assert!(matches!(
            view.get(2),
            Err(Error::OutOfRange { index: 2, count: 2 })
        ));
        assert_eq!(view.total_len(), 11);

        let slices = view.io_slices();
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"hello");
    }

    #[test_traced]
    fn test_mut_view_writes_through() {
        let mut a = [0u8; 3];
        let mut b = [0u8; 2];
        {
            let mut view = ScatterGatherMut::new(vec![&mut a[..], &mut b[..]]);
            assert_eq!(view.total_len(), 5);
            view.get_mut(0).unwrap().copy_from_slice(b"abc");
            view.get_mut(1).unwrap().copy_from_slice(b"de");
            assert!(view.get_mut(2).is_err());
        }
        assert_eq!(&a, b"abc");
        assert_eq!(&b, b"de");
    }

    #[test_traced]
    fn test_iter_mut_fills_extents() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 3];
        {
            let mut view = ScatterGatherMut::new(vec![&mut a[..], &mut b[..]]);
            for (i, extent) in view.iter_mut().enumerate() {
                extent.fill(i as u8 + 1);
            }
            assert_eq!(view.iter_mut().map(|extent| extent.len()).sum::<usize>(), 5);
        }
        assert_eq!(a, [1, 1]);
        assert_eq!(b, [2, 2, 2]);
    }
}
