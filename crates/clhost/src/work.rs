//! Launch geometry.

use crate::error::{ClError, Result};

/// Number of work-groups of at most `max_local_size` items needed to cover
/// `n` items.
///
/// Returns 1 whenever a single group covers everything, including `n == 0`;
/// callers that launch over the result must reject an empty range themselves.
///
/// # Panics
///
/// Panics if `max_local_size` is zero and `n` is not.
#[must_use]
pub const fn group_count(max_local_size: usize, n: usize) -> usize {
    if max_local_size >= n {
        1
    } else {
        n.div_ceil(max_local_size)
    }
}

/// Immutable global/local/offset geometry of a kernel launch, 1 to 3
/// dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkSize {
    dims: usize,
    global: [usize; 3],
    local: [usize; 3],
    offset: Option<[usize; 3]>,
}

impl WorkSize {
    /// Builds a geometry from explicit extents.
    ///
    /// # Errors
    ///
    /// Returns [`ClError::InvalidArgument`] if `global` has 0 or more than 3
    /// entries, or if `local` or `offset` differ from it in length.
    pub fn new(global: &[usize], local: &[usize], offset: Option<&[usize]>) -> Result<Self> {
        let dims = global.len();
        if !(1..=3).contains(&dims) {
            return Err(ClError::invalid(format!(
                "work size must have 1 to 3 dimensions, got {dims}"
            )));
        }
        if local.len() != dims {
            return Err(ClError::invalid(format!(
                "local size has {} dimensions, global size has {dims}",
                local.len()
            )));
        }
        if let Some(offset) = offset {
            if offset.len() != dims {
                return Err(ClError::invalid(format!(
                    "offset has {} dimensions, global size has {dims}",
                    offset.len()
                )));
            }
        }
        Ok(Self {
            dims,
            global: pad(global),
            local: pad(local),
            offset: offset.map(pad),
        })
    }

    /// A single work-group covering the whole of `global`, no offset.
    ///
    /// # Errors
    ///
    /// Fails like [`WorkSize::new`] on a bad dimensionality.
    pub fn whole(global: &[usize]) -> Result<Self> {
        Self::new(global, global, None)
    }

    /// One-dimensional geometry.
    #[must_use]
    pub const fn linear(global: usize, local: usize) -> Self {
        Self {
            dims: 1,
            global: [global, 1, 1],
            local: [local, 1, 1],
            offset: None,
        }
    }

    /// Two-dimensional geometry.
    #[must_use]
    pub const fn planar(global: [usize; 2], local: [usize; 2]) -> Self {
        Self {
            dims: 2,
            global: [global[0], global[1], 1],
            local: [local[0], local[1], 1],
            offset: None,
        }
    }

    #[must_use]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    #[must_use]
    pub fn global(&self) -> &[usize] {
        &self.global[..self.dims]
    }

    #[must_use]
    pub fn local(&self) -> &[usize] {
        &self.local[..self.dims]
    }

    #[must_use]
    pub fn offset(&self) -> Option<&[usize]> {
        self.offset.as_ref().map(|o| &o[..self.dims])
    }

    /// Total number of work-items.
    #[must_use]
    pub fn items(&self) -> usize {
        self.global().iter().product()
    }

    /// Work-groups per dimension, rounding partial groups up.
    #[must_use]
    pub fn groups(&self) -> Vec<usize> {
        self.global()
            .iter()
            .zip(self.local())
            .map(|(&g, &l)| if l == 0 { 0 } else { group_count(l, g) })
            .collect()
    }
}

fn pad(extents: &[usize]) -> [usize; 3] {
    let mut out = [1; 3];
    out[..extents.len()].copy_from_slice(extents);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_count_is_tight_ceiling() {
        for max_local in 1..=40 {
            for n in 1..=200 {
                let groups = group_count(max_local, n);
                if max_local >= n {
                    assert_eq!(groups, 1, "max_local={max_local} n={n}");
                } else {
                    assert!(groups > 1);
                    assert!(groups * max_local >= n);
                    assert!((groups - 1) * max_local < n);
                }
            }
        }
    }

    #[test]
    fn group_count_never_returns_zero() {
        assert_eq!(group_count(256, 0), 1);
        assert_eq!(group_count(256, 1000), 4);
        assert_eq!(group_count(256, 1024), 4);
        assert_eq!(group_count(256, 1025), 5);
    }

    #[test]
    fn mismatched_dimensions_fail() {
        assert!(WorkSize::new(&[8, 8], &[4], None).is_err());
        assert!(WorkSize::new(&[8], &[4], Some(&[0, 0])).is_err());
        assert!(WorkSize::new(&[], &[], None).is_err());
        assert!(WorkSize::new(&[1, 1, 1, 1], &[1, 1, 1, 1], None).is_err());
    }

    #[test]
    fn values_are_preserved_verbatim() {
        let work = WorkSize::new(&[1024, 3], &[256, 1], Some(&[16, 2])).unwrap();
        assert_eq!(work.dims(), 2);
        assert_eq!(work.global(), &[1024, 3]);
        assert_eq!(work.local(), &[256, 1]);
        assert_eq!(work.offset(), Some(&[16, 2][..]));
        assert_eq!(work.groups(), vec![4, 3]);
    }

    #[test]
    fn whole_uses_global_as_local() {
        let work = WorkSize::whole(&[7, 5, 3]).unwrap();
        assert_eq!(work.local(), work.global());
        assert_eq!(work.offset(), None);
        assert_eq!(work.items(), 105);
    }

    #[test]
    fn linear_and_planar_shapes() {
        let lin = WorkSize::linear(1000, 256);
        assert_eq!((lin.dims(), lin.global(), lin.local()), (1, &[1000][..], &[256][..]));
        let plane = WorkSize::planar([4, 1000], [1, 256]);
        assert_eq!(plane.global(), &[4, 1000]);
        assert_eq!(plane.groups(), vec![4, 4]);
    }
}
