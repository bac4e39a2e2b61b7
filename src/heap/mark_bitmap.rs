use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::{ObjectRef, LOG_MIN_OBJECT_ALIGNMENT, MIN_OBJECT_ALIGNMENT};

#[cfg(target_pointer_width = "64")]
pub const LOG_BITS_PER_WORD: usize = 6;
#[cfg(target_pointer_width = "32")]
pub const LOG_BITS_PER_WORD: usize = 5;

pub const BITS_PER_WORD: usize = 1 << LOG_BITS_PER_WORD;

/// Two mark bits per object granule: the strong bit at an even index and the weak bit right
/// after it. A weak bit only ever appears together with its strong bit unset; marking strong
/// over a weak mark is an upgrade.
pub struct MarkBitmap {
    map: Box<[AtomicUsize]>,
    size: usize,
    covered_start: usize,
    covered_end: usize,
}

impl MarkBitmap {
    /// Creates a bitmap covering `[start, start + size)`.
    pub fn new(start: usize, size: usize) -> Self {
        assert!(
            start % MIN_OBJECT_ALIGNMENT == 0,
            "heap start {:#x} must be aligned to {} bytes",
            start,
            MIN_OBJECT_ALIGNMENT
        );
        let bits = Self::compute_size(size);
        let words = Self::raw_to_words_align_up(bits);

        Self {
            map: (0..words).map(|_| AtomicUsize::new(0)).collect(),
            size: bits,
            covered_start: start,
            covered_end: start + size,
        }
    }

    pub const fn compute_size(heap_size: usize) -> usize {
        (heap_size >> LOG_MIN_OBJECT_ALIGNMENT) * 2
    }

    pub const fn raw_to_words_align_down(bit: usize) -> usize {
        bit >> LOG_BITS_PER_WORD
    }

    pub const fn raw_to_words_align_up(bit: usize) -> usize {
        Self::raw_to_words_align_down(bit + (BITS_PER_WORD - 1))
    }

    pub const fn bit_mask(bit: usize) -> usize {
        1 << Self::bit_in_word(bit)
    }

    pub const fn bit_in_word(bit: usize) -> usize {
        bit & (BITS_PER_WORD - 1)
    }

    pub fn covers(&self, obj: ObjectRef) -> bool {
        let addr = obj.to_address();
        addr >= self.covered_start && addr < self.covered_end
    }

    fn verify_index(&self, index: usize) {
        assert!(
            index < self.size,
            "BitMap index is out of bounds: {} >= {}",
            index,
            self.size
        )
    }

    pub fn address_to_index(&self, obj: ObjectRef) -> usize {
        assert!(
            self.covers(obj),
            "{:?} is outside of the marked range [{:#x}, {:#x})",
            obj,
            self.covered_start,
            self.covered_end
        );
        ((obj.to_address() - self.covered_start) >> LOG_MIN_OBJECT_ALIGNMENT) << 1
    }

    pub fn index_to_address(&self, index: usize) -> ObjectRef {
        ObjectRef::from_address(self.covered_start + ((index >> 1) << LOG_MIN_OBJECT_ALIGNMENT))
    }

    fn word(&self, bit: usize) -> &AtomicUsize {
        self.verify_index(bit);
        &self.map[Self::raw_to_words_align_down(bit)]
    }

    pub fn at(&self, index: usize) -> bool {
        (self.word(index).load(Ordering::Acquire) & Self::bit_mask(index)) != 0
    }

    /// Marks `obj` strongly. Returns true if this call set the strong bit; `was_upgraded` then
    /// tells whether the object had been marked weakly before.
    #[inline]
    pub fn mark_strong(&self, obj: ObjectRef, was_upgraded: &mut bool) -> bool {
        let bit = self.address_to_index(obj);
        let addr = self.word(bit);
        let mask = Self::bit_mask(bit);
        let mask_weak = Self::bit_mask(bit + 1);
        let mut old_val = addr.load(Ordering::Relaxed);

        loop {
            let new_val = old_val | mask;
            if new_val == old_val {
                return false;
            }

            match addr.compare_exchange_weak(old_val, new_val, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    *was_upgraded = (old_val & mask_weak) != 0;
                    return true;
                }
                Err(val) => old_val = val,
            }
        }
    }

    /// Marks `obj` weakly. Fails if the object is already marked in any way.
    #[inline]
    pub fn mark_weak(&self, obj: ObjectRef) -> bool {
        let bit = self.address_to_index(obj);
        let addr = self.word(bit);
        let mask_strong = Self::bit_mask(bit);
        let mask_weak = Self::bit_mask(bit + 1);
        let mut old_val = addr.load(Ordering::Relaxed);

        loop {
            if (old_val & (mask_strong | mask_weak)) != 0 {
                return false;
            }

            let new_val = old_val | mask_weak;
            match addr.compare_exchange_weak(old_val, new_val, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(val) => old_val = val,
            }
        }
    }

    #[inline]
    pub fn is_marked_strong(&self, obj: ObjectRef) -> bool {
        self.at(self.address_to_index(obj))
    }

    #[inline]
    pub fn is_marked_weak(&self, obj: ObjectRef) -> bool {
        self.at(self.address_to_index(obj) + 1)
    }

    #[inline]
    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        let index = self.address_to_index(obj);
        let mask = 3 << Self::bit_in_word(index);
        (self.word(index).load(Ordering::Acquire) & mask) != 0
    }

    pub fn clear(&self) {
        for word in self.map.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Objects with any mark bit set, in address order.
    pub fn marked_objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.map.iter().enumerate().flat_map(move |(word_index, word)| {
            let mut bits = word.load(Ordering::Acquire);
            let base = word_index << LOG_BITS_PER_WORD;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                // Drop both bits of the granule so an object is reported once.
                let granule = bit & !1;
                bits &= !(3 << granule);
                Some(self.index_to_address(base + granule))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10000;

    fn obj(granule: usize) -> ObjectRef {
        ObjectRef::from_address(BASE + granule * MIN_OBJECT_ALIGNMENT)
    }

    #[test]
    fn test_mark_strong_once() {
        let bitmap = MarkBitmap::new(BASE, 4096);
        let mut upgraded = false;

        assert!(!bitmap.is_marked(obj(3)));
        assert!(bitmap.mark_strong(obj(3), &mut upgraded));
        assert!(!upgraded);
        assert!(!bitmap.mark_strong(obj(3), &mut upgraded));
        assert!(bitmap.is_marked_strong(obj(3)));
        assert!(!bitmap.is_marked_weak(obj(3)));
        assert!(!bitmap.is_marked(obj(2)));
        assert!(!bitmap.is_marked(obj(4)));
    }

    #[test]
    fn test_weak_then_strong_is_upgrade() {
        let bitmap = MarkBitmap::new(BASE, 4096);
        let mut upgraded = false;

        assert!(bitmap.mark_weak(obj(31)));
        assert!(!bitmap.mark_weak(obj(31)));
        assert!(bitmap.is_marked(obj(31)));
        assert!(!bitmap.is_marked_strong(obj(31)));

        assert!(bitmap.mark_strong(obj(31), &mut upgraded));
        assert!(upgraded);
        assert!(!bitmap.mark_weak(obj(31)));
    }

    #[test]
    fn test_marked_objects_and_clear() {
        let bitmap = MarkBitmap::new(BASE, 4096);
        let mut upgraded = false;

        bitmap.mark_strong(obj(0), &mut upgraded);
        bitmap.mark_weak(obj(32));
        bitmap.mark_weak(obj(100));
        bitmap.mark_strong(obj(100), &mut upgraded);

        let marked = bitmap.marked_objects().collect::<Vec<_>>();
        assert_eq!(marked, vec![obj(0), obj(32), obj(100)]);

        bitmap.clear();
        assert_eq!(bitmap.marked_objects().count(), 0);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_panics() {
        let bitmap = MarkBitmap::new(BASE, 4096);
        bitmap.is_marked(ObjectRef::from_address(BASE + 4096));
    }
}
