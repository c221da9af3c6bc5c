//! Bitmap pools for protocol handles.
//!
//! Fids and tags are both allocated next-fit out of a word bitmap with a
//! rotating hint, so freshly released slots are not immediately reused.

use std::sync::Mutex;

use super::protocol::{NOTAG, ROOT_FID};

pub const DEFAULT_MAX_FIDS: u32 = 256;
pub const DEFAULT_MAX_TAGS: u32 = 256;

struct Bitmap {
    words: Vec<u32>,
    capacity: u32,
    hint: u32,
}

impl Bitmap {
    fn new(capacity: u32) -> Self {
        let words = vec![0u32; capacity.div_ceil(32) as usize];
        Bitmap { words, capacity, hint: 0 }
    }

    fn set(&mut self, slot: u32) {
        self.words[(slot / 32) as usize] |= 1 << (slot % 32);
    }

    fn clear(&mut self, slot: u32) {
        self.words[(slot / 32) as usize] &= !(1 << (slot % 32));
    }

    fn is_set(&self, slot: u32) -> bool {
        self.words[(slot / 32) as usize] & (1 << (slot % 32)) != 0
    }

    /// Next-fit scan from the hint; None when every slot is taken.
    fn acquire(&mut self) -> Option<u32> {
        for i in 0..self.capacity {
            let slot = (self.hint + i) % self.capacity;
            if !self.is_set(slot) {
                self.set(slot);
                self.hint = (slot + 1) % self.capacity;
                return Some(slot);
            }
        }
        None
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Pool of 32-bit fids. Slot 0 is reserved at construction for the
/// attach root.
pub struct FidPool {
    bitmap: Mutex<Bitmap>,
}

impl FidPool {
    pub fn new(max_fids: u32) -> Self {
        let mut bitmap = Bitmap::new(max_fids);
        bitmap.set(ROOT_FID);
        bitmap.hint = 1;
        FidPool { bitmap: Mutex::new(bitmap) }
    }

    pub fn allocate(&self) -> Option<u32> {
        self.bitmap.lock().unwrap().acquire()
    }

    /// Mark a specific fid in use. Used to re-pin the root slot on
    /// reconnect; idempotent.
    pub fn reserve(&self, fid: u32) {
        let mut bitmap = self.bitmap.lock().unwrap();
        if fid < bitmap.capacity {
            bitmap.set(fid);
        }
    }

    /// Double release and out-of-range fids are tolerated.
    pub fn release(&self, fid: u32) {
        let mut bitmap = self.bitmap.lock().unwrap();
        if fid < bitmap.capacity {
            bitmap.clear(fid);
        }
    }

    pub fn is_allocated(&self, fid: u32) -> bool {
        let bitmap = self.bitmap.lock().unwrap();
        fid < bitmap.capacity && bitmap.is_set(fid)
    }

    /// Number of fids currently marked in use.
    pub fn in_use(&self) -> usize {
        self.bitmap.lock().unwrap().count()
    }
}

impl Default for FidPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FIDS)
    }
}

/// Pool of 16-bit transaction tags. Never yields NOTAG, which is used
/// literally by Tversion.
pub struct TagPool {
    bitmap: Mutex<Bitmap>,
}

impl TagPool {
    pub fn new(max_tags: u32) -> Self {
        TagPool { bitmap: Mutex::new(Bitmap::new(max_tags.min(u16::MAX as u32))) }
    }

    pub fn allocate(&self) -> Option<u16> {
        self.bitmap.lock().unwrap().acquire().map(|slot| slot as u16)
    }

    pub fn release(&self, tag: u16) {
        if tag == NOTAG {
            return;
        }
        let mut bitmap = self.bitmap.lock().unwrap();
        if (tag as u32) < bitmap.capacity {
            bitmap.clear(tag as u32);
        }
    }

    pub fn in_use(&self) -> usize {
        self.bitmap.lock().unwrap().count()
    }
}

impl Default for TagPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TAGS)
    }
}
