// This file is part of FakeDLM.

// FakeDLM is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// FakeDLM is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with FakeDLM. If not, see <https://www.gnu.org/licenses/>.

use std::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not},
};

/// The maximum number of cluster nodes, bounded by the mask width.
pub const MAX_NODES: usize = 32;

/// The identifier of a cluster node, assigned by position in the startup
/// node list, starting from 1.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        debug_assert!(id >= 1 && id <= MAX_NODES as u32);
        Self(id)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Returns the mask with only this node's bit set; node id n maps to
    /// bit n - 1.
    #[inline]
    pub fn mask(self) -> NodeMask {
        NodeMask(1 << (self.0 - 1))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fixed-width set of node ids.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct NodeMask(u32);

impl NodeMask {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, id: NodeId) -> bool {
        !(self & id.mask()).is_empty()
    }

    /// Returns `true` if every bit of `other` is also set in `self`.
    #[inline]
    pub fn contains_all(self, other: Self) -> bool {
        other.0 & !self.0 == 0
    }

    #[inline]
    pub fn insert(&mut self, id: NodeId) {
        self.0 |= id.mask().0;
    }

    #[inline]
    pub fn remove(&mut self, id: NodeId) {
        self.0 &= !id.mask().0;
    }

    #[inline]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates over the node ids in the set, in ascending order.
    pub fn iter(self) -> impl Iterator<Item = NodeId> {
        (1..=MAX_NODES as u32)
            .map(NodeId)
            .filter(move |id| self.contains(*id))
    }
}

impl BitOr for NodeMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for NodeMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for NodeMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for NodeMask {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for NodeMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Display for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (n, id) in self.iter().enumerate() {
            if n > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "]")
    }
}
