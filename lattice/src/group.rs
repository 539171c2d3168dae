// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Groups: unordered sets of global unit ids, the value type from which
//! teams are created.
//!
//! A group is stored as two parallel arrays: `g2l` maps a global unit id
//! to its local index (or −1), `l2g` maps a local index back to the global
//! id. All set operations mutate the `g2l` side and then rebuild `l2g` and
//! the cached size from it, which keeps the local indices dense and
//! ordered by global id.

use crate::error::{ErrorCode, Result};
use crate::unit::GlobalUnit;
use core::fmt;

/// Maximum number of units a group (and thus a team) can hold.
pub const GROUP_MAX_SIZE: usize = 256;

const ABSENT: i32 = -1;

/// An unordered set of at most [`GROUP_MAX_SIZE`] global unit ids.
#[derive(Clone)]
pub struct Group {
    g2l: [i32; GROUP_MAX_SIZE],
    l2g: [i32; GROUP_MAX_SIZE],
    size: usize,
}

// === impl Group ===

impl Group {
    /// The empty group.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            g2l: [ABSENT; GROUP_MAX_SIZE],
            l2g: [ABSENT; GROUP_MAX_SIZE],
            size: 0,
        }
    }

    /// A group containing `units`.
    ///
    /// # Errors
    ///
    /// `Inval` if any id is out of range.
    pub fn from_units(units: impl IntoIterator<Item = GlobalUnit>) -> Result<Self> {
        let mut group = Self::new();
        for unit in units {
            group.add(unit)?;
        }
        Ok(group)
    }

    /// A group of the contiguous id range `0..n`.
    pub fn range(n: i32) -> Result<Self> {
        Self::from_units((0..n).map(GlobalUnit::new))
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Adds `unit` to the group. Adding a present member is a no-op.
    pub fn add(&mut self, unit: GlobalUnit) -> Result<()> {
        let idx = Self::index_of(unit)?;
        if self.g2l[idx] == ABSENT {
            self.g2l[idx] = 1;
            self.rebuild();
        }
        Ok(())
    }

    /// Removes `unit` from the group. Removing an absent member is a
    /// no-op.
    pub fn remove(&mut self, unit: GlobalUnit) -> Result<()> {
        let idx = Self::index_of(unit)?;
        if self.g2l[idx] != ABSENT {
            self.g2l[idx] = ABSENT;
            self.rebuild();
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, unit: GlobalUnit) -> bool {
        Self::index_of(unit)
            .is_ok_and(|idx| self.g2l[idx] != ABSENT)
    }

    /// The local index of `unit` within this group, or `None` if absent.
    #[must_use]
    pub fn local_of(&self, unit: GlobalUnit) -> Option<usize> {
        let idx = Self::index_of(unit).ok()?;
        usize::try_from(self.g2l[idx]).ok()
    }

    /// The global id at local index `local`, or `None` if out of range.
    #[must_use]
    pub fn global_at(&self, local: usize) -> Option<GlobalUnit> {
        (local < self.size).then(|| GlobalUnit::new(self.l2g[local]))
    }

    /// Iterates the members in local-index order (ascending global id).
    pub fn members(&self) -> impl Iterator<Item = GlobalUnit> + '_ {
        self.l2g[..self.size].iter().map(|&id| GlobalUnit::new(id))
    }

    /// The union of `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Group) -> Group {
        let mut out = Self::new();
        for i in 0..GROUP_MAX_SIZE {
            if self.g2l[i] != ABSENT || other.g2l[i] != ABSENT {
                out.g2l[i] = 1;
            }
        }
        out.rebuild();
        out
    }

    /// The intersection of `self` and `other`.
    #[must_use]
    pub fn intersect(&self, other: &Group) -> Group {
        let mut out = Self::new();
        for i in 0..GROUP_MAX_SIZE {
            if self.g2l[i] != ABSENT && other.g2l[i] != ABSENT {
                out.g2l[i] = 1;
            }
        }
        out.rebuild();
        out
    }

    /// The members of `self` that are not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Group) -> Group {
        let mut out = Self::new();
        for i in 0..GROUP_MAX_SIZE {
            if self.g2l[i] != ABSENT && other.g2l[i] == ABSENT {
                out.g2l[i] = 1;
            }
        }
        out.rebuild();
        out
    }

    /// Partitions the members into `n` contiguous chunks whose sizes
    /// differ by at most one; the remainder goes to the low-index parts.
    ///
    /// # Errors
    ///
    /// `Inval` if `n` is zero.
    pub fn split(&self, n: usize) -> Result<Vec<Group>> {
        if n == 0 {
            return Err(ErrorCode::Inval);
        }
        let per = self.size / n;
        let rem = self.size % n;
        let mut parts = Vec::with_capacity(n);
        let mut next = 0usize;
        for i in 0..n {
            let take = if i < rem { per + 1 } else { per };
            let mut part = Self::new();
            for local in next..next + take {
                part.g2l[usize::try_from(self.l2g[local]).unwrap()] = 1;
            }
            part.rebuild();
            next += take;
            parts.push(part);
        }
        Ok(parts)
    }

    /// Rebuilds `l2g` and the cached size from the `g2l` side.
    fn rebuild(&mut self) {
        let mut n = 0usize;
        self.l2g = [ABSENT; GROUP_MAX_SIZE];
        for i in 0..GROUP_MAX_SIZE {
            if self.g2l[i] != ABSENT {
                self.l2g[n] = i32::try_from(i).unwrap();
                self.g2l[i] = i32::try_from(n).unwrap();
                n += 1;
            }
        }
        self.size = n;
    }

    fn index_of(unit: GlobalUnit) -> Result<usize> {
        usize::try_from(unit.get())
            .ok()
            .filter(|&idx| idx < GROUP_MAX_SIZE)
            .ok_or(ErrorCode::Inval)
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.l2g[..self.size] == other.l2g[..other.size]
    }
}

impl Eq for Group {}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.members()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn group_of(ids: &[i32]) -> Group {
        Group::from_units(ids.iter().copied().map(GlobalUnit::new)).unwrap()
    }

    #[test]
    fn l2g_g2l_are_inverse() {
        let g = group_of(&[5, 2, 9, 100]);
        assert_eq!(g.size(), 4);
        for local in 0..g.size() {
            let unit = g.global_at(local).unwrap();
            assert_eq!(g.local_of(unit), Some(local));
        }
    }

    #[test]
    fn set_algebra_identities() {
        let g = group_of(&[1, 3, 5, 7]);
        assert_eq!(g.union(&g), g);
        assert_eq!(g.intersect(&g), g);
        assert_eq!(g.difference(&g), Group::new());
    }

    #[test]
    fn union_and_difference() {
        let a = group_of(&[0, 1, 2]);
        let b = group_of(&[2, 3]);
        assert_eq!(a.union(&b), group_of(&[0, 1, 2, 3]));
        assert_eq!(a.intersect(&b), group_of(&[2]));
        assert_eq!(a.difference(&b), group_of(&[0, 1]));
    }

    #[test]
    fn split_distributes_remainder_low() {
        let g = group_of(&[0, 1, 2, 3, 4, 5, 6]);
        let parts = g.split(3).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], group_of(&[0, 1, 2]));
        assert_eq!(parts[1], group_of(&[3, 4]));
        assert_eq!(parts[2], group_of(&[5, 6]));
    }

    #[test]
    fn split_more_parts_than_members() {
        let g = group_of(&[0, 1]);
        let parts = g.split(4).unwrap();
        assert_eq!(parts[0].size(), 1);
        assert_eq!(parts[1].size(), 1);
        assert!(parts[2].is_empty());
        assert!(parts[3].is_empty());
    }

    #[test]
    fn out_of_range_is_inval() {
        let mut g = Group::new();
        assert_eq!(g.add(GlobalUnit::new(256)), Err(ErrorCode::Inval));
        assert_eq!(g.add(GlobalUnit::UNDEFINED), Err(ErrorCode::Inval));
    }

    proptest! {
        #[test]
        fn union_is_commutative(a in proptest::collection::vec(0i32..256, 0..32), b in proptest::collection::vec(0i32..256, 0..32)) {
            let ga = group_of(&a);
            let gb = group_of(&b);
            prop_assert_eq!(ga.union(&gb), gb.union(&ga));
        }

        #[test]
        fn split_partitions(ids in proptest::collection::btree_set(0i32..256, 0..64), n in 1usize..8) {
            let ids: Vec<i32> = ids.into_iter().collect();
            let g = group_of(&ids);
            let parts = g.split(n).unwrap();
            let mut rebuilt = Group::new();
            let mut total = 0;
            for part in &parts {
                total += part.size();
                rebuilt = rebuilt.union(part);
            }
            prop_assert_eq!(total, g.size());
            prop_assert_eq!(rebuilt, g);
        }
    }
}
