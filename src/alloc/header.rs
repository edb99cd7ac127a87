use std::{
    alloc::Layout,
    fmt,
    mem,
    panic::Location,
    ptr::NonNull,
};

use crate::util::num::{checked_total, round_up};

/// Alignment of every block handed out by [`InstrumentedAlloc`]. This matches
/// what `malloc()` promises on 64-bit targets.
///
/// [`InstrumentedAlloc`]: super::InstrumentedAlloc
pub const BLOCK_ALIGN: usize = 16;

/// Sentinel stored in the header of a block. Anything that isn't
/// [`GuardTag::LIVE`] must never be freed or reallocated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GuardTag(u32);

impl GuardTag {
    pub const LIVE: Self = Self(0xDEAD_BABE);
    pub const FREED: Self = Self(0xDEAD_DEAD);

    pub const fn is_live(self) -> bool {
        self.0 == Self::LIVE.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for GuardTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LIVE => write!(f, "GuardTag::LIVE"),
            Self::FREED => write!(f, "GuardTag::FREED"),
            Self(bits) => write!(f, "GuardTag({bits:#010x})"),
        }
    }
}

/// Where an allocation came from. Only recorded in diagnostic mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Provenance {
    /// A human readable category, usually the type stored in the block
    pub type_tag: Option<&'static str>,
    /// The call site that asked for the block
    pub location: Option<&'static Location<'static>>,
}

impl Provenance {
    pub const fn empty() -> Self {
        Self {
            type_tag: None,
            location: None,
        }
    }

    /// Provenance pointing at whoever called the (`#[track_caller]`) function
    /// this is called from.
    #[track_caller]
    pub fn caller(type_tag: Option<&'static str>) -> Self {
        Self {
            type_tag,
            location: Some(Location::caller()),
        }
    }

    pub fn file(&self) -> Option<&'static str> {
        self.location.map(Location::file)
    }

    pub fn line(&self) -> u32 {
        self.location.map_or(0, Location::line)
    }
}

/// Index of a block in the live registry.
pub type Slot = usize;

/// Stored in [`BlockHeader`] when the block isn't in any registry. Kept as a
/// plain `usize` so that any bit pattern in a header is a valid read.
const NO_SLOT: usize = usize::MAX;

/// Metadata that sits in front of every block handed out by
/// [`InstrumentedAlloc`]. A block looks like this
///
/// ```plaintext
/// +--------------------+ <- raw block, from the `RawHeap`
/// | padding...         | HEADER_SIZE bytes
/// | BlockHeader        |
/// +--------------------+ <- pointer handed to the caller
/// | payload            | block_header.size bytes
/// +--------------------+
/// ```
///
/// [`InstrumentedAlloc`]: super::InstrumentedAlloc
#[derive(Debug)]
#[repr(C)]
pub struct BlockHeader {
    pub(crate) guard: GuardTag,
    /// The exact requested size of this allocation
    pub(crate) size: usize,
    /// [`NO_SLOT`] unless registered, use [`BlockHeader::slot`]
    pub(crate) slot: usize,
    pub(crate) provenance: Provenance,
}

/// Distance from the start of a raw block to the payload.
pub const HEADER_SIZE: usize = round_up(mem::size_of::<BlockHeader>(), BLOCK_ALIGN);

const _: () = assert!(mem::align_of::<BlockHeader>() <= BLOCK_ALIGN);

impl BlockHeader {
    pub(crate) const fn live(size: usize, provenance: Provenance) -> Self {
        Self {
            guard: GuardTag::LIVE,
            size,
            slot: NO_SLOT,
            provenance,
        }
    }

    /// Layout of the raw block for a `size` byte payload, `None` if that
    /// doesn't fit in the address space.
    pub fn raw_layout(size: usize) -> Option<Layout> {
        let total = checked_total(HEADER_SIZE, size)?;
        Layout::from_size_align(total, BLOCK_ALIGN).ok()
    }

    /// Where the header lives inside a raw block.
    pub(crate) fn in_block(block: NonNull<u8>) -> NonNull<BlockHeader> {
        // SAFETY: every raw block is at least HEADER_SIZE bytes long, so this
        // stays inside it
        unsafe {
            NonNull::new_unchecked(
                block
                    .as_ptr()
                    .add(HEADER_SIZE - mem::size_of::<BlockHeader>())
                    .cast::<BlockHeader>(),
            )
        }
    }

    pub(crate) fn payload_of(block: NonNull<u8>) -> NonNull<u8> {
        // SAFETY: in bounds (or one past the end, for an empty payload)
        unsafe { NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)) }
    }

    /// Inverse of [`BlockHeader::payload_of`].
    ///
    /// # Safety
    ///
    /// `payload` must be at least `HEADER_SIZE` bytes past the start of some
    /// allocation. Nothing is read.
    pub(crate) unsafe fn block_of(payload: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)) }
    }

    pub const fn guard(&self) -> GuardTag {
        self.guard
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn slot(&self) -> Option<Slot> {
        slot_from_raw(self.slot)
    }

    pub(crate) fn set_slot(&mut self, slot: Option<Slot>) {
        self.slot = slot.unwrap_or(NO_SLOT);
    }

    pub const fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}

/// Decode the raw `slot` field of a header.
pub(crate) const fn slot_from_raw(raw: usize) -> Option<Slot> {
    match raw {
        NO_SLOT => None,
        slot => Some(slot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_before_an_aligned_payload() {
        assert!(HEADER_SIZE >= mem::size_of::<BlockHeader>());
        assert_eq!(HEADER_SIZE % BLOCK_ALIGN, 0);
        // the header itself must be aligned when the block is
        assert_eq!(
            (HEADER_SIZE - mem::size_of::<BlockHeader>()) % mem::align_of::<BlockHeader>(),
            0
        );
    }

    #[test]
    fn raw_layout_adds_the_header() {
        let layout = BlockHeader::raw_layout(100).unwrap();
        assert_eq!(layout.size(), HEADER_SIZE + 100);
        assert_eq!(layout.align(), BLOCK_ALIGN);
        assert!(BlockHeader::raw_layout(usize::MAX).is_none());
    }

    #[test]
    fn payload_and_block_are_inverses() {
        let mut buf = [0u128; 8];
        let block = NonNull::from(&mut buf).cast::<u8>();
        let payload = BlockHeader::payload_of(block);
        assert_eq!(payload.as_ptr() as usize - block.as_ptr() as usize, HEADER_SIZE);
        assert_eq!(unsafe { BlockHeader::block_of(payload) }, block);
        let header = BlockHeader::in_block(block);
        assert!((header.as_ptr() as usize) < payload.as_ptr() as usize);
    }

    #[test]
    fn slot_round_trips_through_the_header() {
        let mut header = BlockHeader::live(8, Provenance::empty());
        assert_eq!(header.slot(), None);
        header.set_slot(Some(3));
        assert_eq!(header.slot(), Some(3));
        header.set_slot(None);
        assert_eq!(header.slot, NO_SLOT);
        assert_eq!(slot_from_raw(0), Some(0));
    }

    #[test]
    fn guard_tags_are_distinct() {
        assert!(GuardTag::LIVE.is_live());
        assert!(!GuardTag::FREED.is_live());
        assert_eq!(format!("{:?}", GuardTag(0x1234)), "GuardTag(0x00001234)");
    }

    #[test]
    fn caller_provenance_points_here() {
        let line = line!() + 1;
        let provenance = Provenance::caller(Some("Foo"));
        assert_eq!(provenance.file(), Some(file!()));
        assert_eq!(provenance.line(), line);
        assert_eq!(Provenance::empty().line(), 0);
    }
}
