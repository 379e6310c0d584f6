//! Opaque memory identifiers.
//!
//! Every allocation is tagged with a [`MemId`] that records where it came
//! from: [`MemId::OS`] for direct OS allocations, or a packed
//! (arena id, exclusive flag, block index) triple for arena runs. Arena
//! indices are stable for the life of the process, so memids stay valid
//! indefinitely without versioning.

use crate::arena::MAX_ARENAS;

/// Identifier of a registered arena, in `1..=127`.
///
/// `0` is reserved to mean "not an arena"; requests that do not target a
/// specific arena use `Option<ArenaId>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId(u8);

impl ArenaId {
    /// Wrap a raw id; `None` unless `1 <= id <= 127`.
    pub fn new(id: u8) -> Option<ArenaId> {
        (1..=127).contains(&id).then_some(ArenaId(id))
    }

    pub(crate) fn from_index(index: usize) -> ArenaId {
        debug_assert!(index < MAX_ARENAS);
        ArenaId(index as u8 + 1)
    }

    /// Slot index of this arena in the registry.
    pub fn index(self) -> usize {
        self.0 as usize - 1
    }

    /// The raw id value.
    pub fn get(self) -> u8 {
        self.0
    }
}

/// Whether an arena with `(id, exclusive)` may serve a request that
/// asked for `req`. Exclusive arenas are reachable only by naming them.
pub(crate) fn id_is_suitable(id: ArenaId, exclusive: bool, req: Option<ArenaId>) -> bool {
    match req {
        None => !exclusive,
        Some(r) => r == id,
    }
}

/// Opaque token recording the origin of an allocation.
///
/// Layout: bits `0..7` hold the arena id, bit `7` the exclusive flag,
/// and the remaining bits the block index within the arena. The all-zero
/// value marks direct OS allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemId(usize);

impl MemId {
    /// Marker for memory allocated directly from the OS.
    pub const OS: MemId = MemId(0);

    pub(crate) fn from_arena(id: ArenaId, exclusive: bool, block: usize) -> MemId {
        debug_assert_eq!((block << 8) >> 8, block);
        MemId((block << 8) | (id.get() as usize) | if exclusive { 0x80 } else { 0 })
    }

    /// True for direct OS allocations.
    pub fn is_os(self) -> bool {
        self.0 == 0
    }

    /// Decode into `(arena id, exclusive, block index)`; `None` for
    /// [`MemId::OS`] or a malformed token.
    pub fn decode(self) -> Option<(ArenaId, bool, usize)> {
        let id = ArenaId::new((self.0 & 0x7f) as u8)?;
        Some((id, self.0 & 0x80 != 0, self.0 >> 8))
    }

    /// Whether memory tagged with this id may serve a request that asked
    /// for `req`. OS memory serves only unspecific requests; arena memory
    /// follows the exclusivity rule.
    pub fn is_suitable(self, req: Option<ArenaId>) -> bool {
        match self.decode() {
            None => req.is_none(),
            Some((id, exclusive, _)) => id_is_suitable(id, exclusive, req),
        }
    }

    /// The raw token value.
    pub fn raw(self) -> usize {
        self.0
    }

    /// Reconstitute a token previously obtained from [`MemId::raw`].
    pub fn from_raw(raw: usize) -> MemId {
        MemId(raw)
    }
}
