//! The process-wide table of address spaces.

use alloc::collections::BTreeMap;
use alloc::sync::Weak;
use core::ops::Bound;

use crate::{AddressSpace, AddressSpaceRef, TeamId, VmError, VmResult};

/// Maps team ids to their address spaces without keeping them alive.
///
/// A space unregisters itself when it is torn down. No [`AddressSpaceRef`] is ever dropped with
/// the table lock held, since dropping the last one re-enters the table.
#[derive(Default)]
pub struct AddressSpaceRegistry {
    spaces: spin::RwLock<BTreeMap<TeamId, Weak<AddressSpace>>>,
}

impl AddressSpaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a reference to the live space of `id`.
    pub fn get(&self, id: TeamId) -> Option<AddressSpaceRef> {
        let space = self.spaces.read().get(&id).and_then(Weak::upgrade)?;
        let space = AddressSpaceRef::from_arc(space);
        // Dropped outside the lock.
        (!space.is_being_deleted()).then_some(space)
    }

    /// Returns true if a live space is registered for `id`.
    pub fn contains(&self, id: TeamId) -> bool {
        self.spaces
            .read()
            .get(&id)
            .is_some_and(|space| space.strong_count() > 0)
    }

    /// Number of live spaces.
    pub fn len(&self) -> usize {
        self.spaces
            .read()
            .values()
            .filter(|space| space.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every live space in id order, one reference at a time.
    pub fn walk(&self) -> AddressSpaceWalk<'_> {
        AddressSpaceWalk {
            registry: self,
            last: None,
            current: None,
        }
    }

    pub(crate) fn register(&self, space: &AddressSpaceRef) -> VmResult<()> {
        let mut spaces = self.spaces.write();
        if spaces
            .get(&space.id())
            .is_some_and(|existing| existing.strong_count() > 0)
        {
            return Err(VmError::InvalidArgument);
        }
        spaces.insert(space.id(), space.downgrade());
        Ok(())
    }

    /// Removes the entry of `id` if it refers to `space` or to a space that is already gone.
    ///
    /// A space torn down by its last release is moved out of its allocation before it drops,
    /// so its address no longer matches the entry; the dead entry is recognised by its strong
    /// count instead.
    pub(crate) fn unregister(&self, id: TeamId, space: *const AddressSpace) {
        let mut spaces = self.spaces.write();
        if spaces.get(&id).is_some_and(|entry| {
            core::ptr::eq(entry.as_ptr(), space) || entry.strong_count() == 0
        }) {
            spaces.remove(&id);
        }
    }
}

/// Hand-over-hand walk over the registered address spaces.
///
/// The walk holds a reference to the space it last yielded and only lets go of it after the
/// next one has been acquired. Spaces that are being torn down are skipped.
pub struct AddressSpaceWalk<'a> {
    registry: &'a AddressSpaceRegistry,
    last: Option<TeamId>,
    current: Option<AddressSpaceRef>,
}

impl AddressSpaceWalk<'_> {
    fn acquire_next(&self, after: Option<TeamId>) -> Option<(TeamId, AddressSpaceRef)> {
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let spaces = self.registry.spaces.read();
        spaces
            .range((lower, Bound::Unbounded))
            .find_map(|(id, space)| space.upgrade().map(|space| (*id, space)))
            .map(|(id, space)| (id, AddressSpaceRef::from_arc(space)))
    }
}

impl Iterator for AddressSpaceWalk<'_> {
    type Item = AddressSpaceRef;

    fn next(&mut self) -> Option<AddressSpaceRef> {
        let mut after = self.last;
        loop {
            let Some((id, space)) = self.acquire_next(after) else {
                self.last = None;
                drop(self.current.take());
                return None;
            };
            after = Some(id);
            if space.is_being_deleted() {
                continue;
            }
            self.last = Some(id);
            let previous = self.current.replace(space.acquire());
            drop(previous);
            return Some(space);
        }
    }
}
