//! Engine-facing object model.
//!
//! The marking engine does not interpret user data; it only needs to know an
//! object's extent and where its reference slots live. Objects are
//! word-aligned and start with a one-word header:
//!
//! ```text
//! +----------------+-----+
//! | payload words  |xx|A |
//! +----------------+-----+
//!  63             2  1  0
//! ```
//!
//! Bit 0 (`A`) marks reference arrays, the only objects scanned in slices.
//! Payload words follow the header; every payload word is either null (0) or
//! a word-aligned heap reference. A plain object with zero slots is a leaf.

use crate::utils::{is_aligned, WORD_SIZE};

const REF_ARRAY_BIT: usize = 1;
const LEN_SHIFT: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeapObjectHeader {
    word: usize,
}

impl HeapObjectHeader {
    #[inline]
    pub fn new_plain(payload_words: usize) -> Self {
        Self {
            word: payload_words << LEN_SHIFT,
        }
    }

    #[inline]
    pub fn new_ref_array(len: usize) -> Self {
        Self {
            word: (len << LEN_SHIFT) | REF_ARRAY_BIT,
        }
    }

    #[inline]
    pub fn payload_words(self) -> usize {
        self.word >> LEN_SHIFT
    }

    #[inline]
    pub fn is_ref_array(self) -> bool {
        self.word & REF_ARRAY_BIT != 0
    }

    /// Total size of the object in words, header included.
    #[inline]
    pub fn size_words(self) -> usize {
        1 + self.payload_words()
    }
}

/// A reference to a heap object: the byte address of its header word.
/// Never null; optionality is expressed with `Option<ObjRef>` or a zero slot
/// word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjRef(usize);

impl ObjRef {
    #[inline]
    pub fn from_addr(addr: usize) -> Self {
        debug_assert!(addr != 0 && is_aligned(addr, WORD_SIZE), "bad ref {:#x}", addr);
        Self(addr)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0
    }

    /// # Safety
    /// `self` must point at an initialized object header.
    #[inline]
    pub unsafe fn header(self) -> HeapObjectHeader {
        (self.0 as *const HeapObjectHeader).read()
    }

    #[inline]
    pub unsafe fn size_words(self) -> usize {
        self.header().size_words()
    }

    #[inline]
    pub unsafe fn is_ref_array(self) -> bool {
        self.header().is_ref_array()
    }

    /// Byte address of the first payload word.
    #[inline]
    pub fn payload_start(self) -> usize {
        self.0 + WORD_SIZE
    }

    /// One-past-the-end byte address of the object.
    #[inline]
    pub unsafe fn end(self) -> usize {
        self.0 + self.size_words() * WORD_SIZE
    }

    #[inline]
    pub unsafe fn slot(self, index: usize) -> Option<ObjRef> {
        debug_assert!(index < self.header().payload_words());
        let word = ((self.payload_start() + index * WORD_SIZE) as *const usize).read();
        if word == 0 {
            None
        } else {
            Some(ObjRef::from_addr(word))
        }
    }

    /// # Safety
    /// The slot must be within the object and the heap must be writable.
    #[inline]
    pub unsafe fn set_slot(self, index: usize, value: Option<ObjRef>) {
        debug_assert!(index < self.header().payload_words());
        let word = value.map_or(0, |r| r.addr());
        ((self.payload_start() + index * WORD_SIZE) as *mut usize).write(word);
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encoding() {
        let h = HeapObjectHeader::new_plain(3);
        assert_eq!(h.payload_words(), 3);
        assert_eq!(h.size_words(), 4);
        assert!(!h.is_ref_array());

        let a = HeapObjectHeader::new_ref_array(1000);
        assert_eq!(a.payload_words(), 1000);
        assert_eq!(a.size_words(), 1001);
        assert!(a.is_ref_array());
    }

    #[test]
    fn slot_access() {
        let mut backing = [0usize; 8];
        backing[0] = HeapObjectHeader::new_plain(7).word;
        let obj = ObjRef::from_addr(backing.as_ptr() as usize);
        unsafe {
            assert_eq!(obj.size_words(), 8);
            assert!(obj.slot(0).is_none());
            obj.set_slot(2, Some(obj));
            assert_eq!(obj.slot(2), Some(obj));
            obj.set_slot(2, None);
            assert!(obj.slot(2).is_none());
        }
    }
}
