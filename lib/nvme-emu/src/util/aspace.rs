// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sparse map of non-overlapping regions within a bounded address space.

use std::collections::{btree_map, BTreeMap};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::ops::RangeBounds;

use thiserror::Error;

#[derive(Debug)]
pub struct ASpace<T> {
    start: usize,
    end: usize,
    map: BTreeMap<usize, (usize, T)>,
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("region outside of address space")]
    OutOfRange,
    #[error("region length is zero or overflows")]
    BadLength,
    #[error("region conflicts with existing registration")]
    Conflict,
    #[error("no region at address")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

/// (start, length, item) of a registered region
type SpaceItem<'a, T> = (usize, usize, &'a T);

impl<T> ASpace<T> {
    /// Create an address space covering the inclusive range [`start`, `end`]
    pub fn new(start: usize, end: usize) -> ASpace<T> {
        assert!(start < end);
        Self { start, end, map: BTreeMap::new() }
    }

    /// Register `item` as covering `len` bytes beginning at `start`
    pub fn register(
        &mut self,
        start: usize,
        len: usize,
        item: T,
    ) -> Result<()> {
        let end = safe_end(start, len).ok_or(Error::BadLength)?;
        if start < self.start || start > self.end || end > self.end {
            return Err(Error::OutOfRange);
        }

        if self.covered_by((Included(start), Included(end))).next().is_some() {
            return Err(Error::Conflict);
        }

        let prev = self.map.insert(start, (len, item));
        debug_assert!(prev.is_none());
        Ok(())
    }

    /// Find the region which contains `point`
    pub fn region_at(&self, point: usize) -> Result<SpaceItem<'_, T>> {
        if point < self.start || point > self.end {
            return Err(Error::OutOfRange);
        }
        match self.map.range((Unbounded, Included(&point))).next_back() {
            Some((start, (len, item)))
                if safe_end(*start, *len).is_some_and(|end| end >= point) =>
            {
                Ok((*start, *len, item))
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Iterate over all regions, sorted by starting point
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { inner: self.map.iter() }
    }

    /// Iterate over regions which are (partially or totally) covered by
    /// `range`
    pub fn covered_by<R>(&self, range: R) -> Range<'_, T>
    where
        R: RangeBounds<usize>,
    {
        // A region starting before the search range may still extend into it,
        // so widen the front bound to include its start.
        let fixed_front = match range.start_bound() {
            Unbounded => Unbounded,
            Excluded(pos) => match self.region_at(pos + 1) {
                Ok((start, _, _)) => Included(start),
                Err(_) => Excluded(*pos),
            },
            Included(pos) => match self.region_at(*pos) {
                Ok((start, _, _)) => Included(start),
                Err(_) => Excluded(*pos),
            },
        };
        let tail = match range.end_bound() {
            Unbounded => Unbounded,
            Excluded(a) => Excluded(*a),
            Included(a) => Included(*a),
        };
        Range { inner: self.map.range((fixed_front, tail)) }
    }
}

/// Inclusive end of a region, or `None` if it is empty or overflows
fn safe_end(start: usize, len: usize) -> Option<usize> {
    if len == 0 {
        None
    } else {
        start.checked_add(len - 1)
    }
}

fn kv_flatten<'a, T>(i: (&'a usize, &'a (usize, T))) -> SpaceItem<'a, T> {
    (*i.0, i.1 .0, &i.1 .1)
}

pub struct Iter<'a, T> {
    inner: btree_map::Iter<'a, usize, (usize, T)>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = SpaceItem<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(kv_flatten)
    }
}

pub struct Range<'a, T> {
    inner: btree_map::Range<'a, usize, (usize, T)>,
}

impl<'a, T> Iterator for Range<'a, T> {
    type Item = SpaceItem<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(kv_flatten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn create_zero_size() {
        let _s: ASpace<u32> = ASpace::new(0, 0);
    }

    #[test]
    fn register_invalid() {
        let mut s: ASpace<u32> = ASpace::new(0, 0x1000);

        assert_eq!(s.register(0x100, 0, 0), Err(Error::BadLength));
        assert_eq!(
            s.register(0x100, usize::MAX - 0x50, 0),
            Err(Error::BadLength)
        );
        assert_eq!(s.register(0xff0, 0x20, 0), Err(Error::OutOfRange));
    }

    #[test]
    fn register_overlaps() {
        let mut s: ASpace<u32> = ASpace::new(0, 0xffff);
        assert!(s.register(0, 0x1000, 0).is_ok());
        assert!(s.register(0x2000, 0x1000, 0).is_ok());
        let expect: Result<()> = Err(Error::Conflict);

        assert_eq!(s.register(0, 0x1000, 0), expect);
        assert_eq!(s.register(0x1ff0, 0x0011, 0), expect);
        assert_eq!(s.register(0x0fff, 0x10, 0), expect);
        assert_eq!(s.register(0x1ff0, 0x1010, 0), expect);
        assert!(s.register(0x1000, 0x1000, 1).is_ok());
        assert_eq!(s.iter().count(), 3);
    }

    #[test]
    fn region_lookup() {
        let end = 0xffff;
        let mut s: ASpace<u32> = ASpace::new(0, end);

        let ent: [(usize, usize, &u32); 2] =
            [(0x100, 0x100, &0), (end - 0xfff, 0x1000, &2)];
        for (a, b, c) in ent.iter() {
            assert!(s.register(*a, *b, **c).is_ok());
        }

        assert_eq!(s.region_at(0x1ff), Ok(ent[0]));
        assert_eq!(s.region_at(end), Ok(ent[1]));
        assert_eq!(s.region_at(0x200), Err(Error::NotFound));
        assert_eq!(s.region_at(end + 1), Err(Error::OutOfRange));

        let covered: Vec<_> = s.covered_by(0x180..0x200).collect();
        assert_eq!(covered, vec![ent[0]]);
    }
}
