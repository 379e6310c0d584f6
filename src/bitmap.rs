//! Atomic multi-field bitmap.
//!
//! Tracks per-block state as one bit per block across an array of
//! machine-word fields. Runs of bits may span field boundaries; claiming
//! a run is all-or-nothing with respect to concurrent claimers. Fields
//! are taken in index order with CAS and undone in reverse on conflict,
//! so every operation stays lock-free under contention.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::Backoff;

/// Bits per bitmap field (one machine word).
pub const FIELD_BITS: usize = usize::BITS as usize;

const FIELD_FULL: usize = usize::MAX;

/// Attempts at a cross-field claim before giving up on this start field.
const MAX_CROSS_RETRIES: usize = 4;

/// Packed (field, bit) position of the first bit of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitIndex(usize);

impl BitIndex {
    /// Position `bit` within field `field`.
    pub fn new(field: usize, bit: usize) -> Self {
        debug_assert!(bit < FIELD_BITS);
        Self(field * FIELD_BITS + bit)
    }

    /// Position at an absolute bit offset.
    pub fn from_bit(bit: usize) -> Self {
        Self(bit)
    }

    /// Index of the containing field.
    pub fn field(self) -> usize {
        self.0 / FIELD_BITS
    }

    /// Offset within the containing field.
    pub fn bit_in_field(self) -> usize {
        self.0 % FIELD_BITS
    }

    /// Absolute bit offset (the block index, for arena bitmaps).
    pub fn bit(self) -> usize {
        self.0
    }
}

/// Prior state of a run observed by [`Bitmap::claim`].
#[derive(Debug, Clone, Copy)]
pub struct ClaimResult {
    /// Every bit in the run was previously zero.
    pub all_zero: bool,
    /// At least one bit in the run was previously zero.
    pub any_zero: bool,
}

/// Fixed-size array of atomic bit fields.
#[derive(Debug)]
pub struct Bitmap {
    fields: Box<[AtomicUsize]>,
}

impl Bitmap {
    /// Create a bitmap of `field_count` fields with every bit clear.
    pub fn new(field_count: usize) -> Self {
        let fields = (0..field_count).map(|_| AtomicUsize::new(0)).collect();
        Self { fields }
    }

    /// Number of fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Raw load of one field.
    pub fn load_field(&self, idx: usize, order: Ordering) -> usize {
        self.fields[idx].load(order)
    }

    /// Set every bit. Only used before the bitmap is shared.
    pub(crate) fn set_all(&self) {
        for field in self.fields.iter() {
            field.store(FIELD_FULL, Ordering::Relaxed);
        }
    }

    /// A mask of `count` bits starting at `bit`, within one field.
    fn mask(count: usize, bit: usize) -> usize {
        debug_assert!(count > 0 && bit + count <= FIELD_BITS);
        if count == FIELD_BITS {
            FIELD_FULL
        } else {
            ((1 << count) - 1) << bit
        }
    }

    /// Split a run into per-field `(field, mask)` chunks in index order.
    fn chunks(idx: BitIndex, count: usize) -> impl Iterator<Item = (usize, usize)> {
        let first = idx.field();
        let bit = idx.bit_in_field();
        let (pre, mid, post) = if bit + count <= FIELD_BITS {
            (Self::mask(count, bit), 0, 0)
        } else {
            let pre_bits = FIELD_BITS - bit;
            let rest = count - pre_bits;
            let post_bits = rest % FIELD_BITS;
            let post = if post_bits == 0 {
                0
            } else {
                Self::mask(post_bits, 0)
            };
            (Self::mask(pre_bits, bit), rest / FIELD_BITS, post)
        };
        std::iter::once((first, pre))
            .chain((0..mid).map(move |i| (first + 1 + i, FIELD_FULL)))
            .chain((post != 0).then_some((first + 1 + mid, post)))
    }

    /// Set `count` bits starting at `idx`, reporting the prior state of
    /// the run.
    pub fn claim(&self, idx: BitIndex, count: usize) -> ClaimResult {
        let mut all_zero = true;
        let mut any_zero = false;
        for (field, mask) in Self::chunks(idx, count) {
            let prev = self.fields[field].fetch_or(mask, Ordering::AcqRel);
            if prev & mask != 0 {
                all_zero = false;
            }
            if prev & mask != mask {
                any_zero = true;
            }
        }
        ClaimResult { all_zero, any_zero }
    }

    /// Clear `count` bits starting at `idx`; true iff every bit was set.
    pub fn unclaim(&self, idx: BitIndex, count: usize) -> bool {
        let mut all_one = true;
        for (field, mask) in Self::chunks(idx, count) {
            let prev = self.fields[field].fetch_and(!mask, Ordering::AcqRel);
            if prev & mask != mask {
                all_one = false;
            }
        }
        all_one
    }

    /// True iff every bit of the run is set.
    pub fn is_claimed(&self, idx: BitIndex, count: usize) -> bool {
        Self::chunks(idx, count)
            .all(|(field, mask)| self.fields[field].load(Ordering::Relaxed) & mask == mask)
    }

    /// Atomically set `count` bits at exactly `idx`, failing without side
    /// effects if any bit of the run is already set.
    pub fn try_claim(&self, idx: BitIndex, count: usize) -> bool {
        let mut backoff = Backoff::new();
        let mut done = 0;
        for (field, mask) in Self::chunks(idx, count) {
            let mut map = self.fields[field].load(Ordering::Relaxed);
            loop {
                if map & mask != 0 {
                    self.undo_chunks(idx, count, done);
                    return false;
                }
                match self.fields[field].compare_exchange(
                    map,
                    map | mask,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => {
                        map = actual;
                        backoff.spin();
                    }
                }
            }
            done += 1;
        }
        true
    }

    /// Clear the first `done` chunks of a partially claimed run, last
    /// chunk first.
    fn undo_chunks(&self, idx: BitIndex, count: usize, done: usize) {
        let claimed: Vec<_> = Self::chunks(idx, count).take(done).collect();
        for (field, mask) in claimed.into_iter().rev() {
            self.fields[field].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Locate and claim the first run of `count` zero bits, searching
    /// fields from `start_field` and wrapping. Runs may span adjacent
    /// fields; the claim is all-or-nothing.
    pub fn try_find_from_claim(&self, start_field: usize, count: usize) -> Option<BitIndex> {
        let field_count = self.fields.len();
        if count == 0 || field_count == 0 {
            return None;
        }
        let mut idx = start_field % field_count;
        for _ in 0..field_count {
            if count <= FIELD_BITS {
                if let Some(claimed) = self.try_find_claim_field(idx, count) {
                    return Some(claimed);
                }
            }
            if let Some(claimed) = self.try_find_claim_across(idx, count) {
                return Some(claimed);
            }
            idx += 1;
            if idx >= field_count {
                idx = 0;
            }
        }
        None
    }

    /// Claim `count` zero bits anywhere inside field `idx`.
    fn try_find_claim_field(&self, idx: usize, count: usize) -> Option<BitIndex> {
        debug_assert!(count <= FIELD_BITS);
        let field = &self.fields[idx];
        let mut map = field.load(Ordering::Relaxed);
        if map == FIELD_FULL {
            return None;
        }

        let max_bit = FIELD_BITS - count;
        let mask = Self::mask(count, 0);
        let mut bit = (!map).trailing_zeros() as usize;
        while bit <= max_bit {
            let m = mask << bit;
            let window = map & m;
            if window == 0 {
                match field.compare_exchange(map, map | m, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => return Some(BitIndex::new(idx, bit)),
                    Err(actual) => {
                        // lost the race; rescan the same window with the
                        // updated field value
                        map = actual;
                        continue;
                    }
                }
            }
            // jump past the highest set bit inside the window
            bit = FIELD_BITS - window.leading_zeros() as usize;
        }
        None
    }

    /// Claim a run that begins in the trailing zeros of field `idx` and
    /// spills into the following fields.
    fn try_find_claim_across(&self, idx: usize, count: usize) -> Option<BitIndex> {
        debug_assert!(count > 0);
        let field_count = self.fields.len();
        let mut backoff = Backoff::new();

        'retry: for _ in 0..=MAX_CROSS_RETRIES {
            let map = self.fields[idx].load(Ordering::Relaxed);
            let initial = map.leading_zeros() as usize;
            if initial == 0 {
                return None;
            }
            if initial >= count {
                // fits in this field after all
                return self.try_find_claim_field(idx, count);
            }
            if idx + 1 >= field_count {
                return None;
            }

            // scan ahead for the remainder of the run
            let mut found = initial;
            let mut last = idx;
            let mut last_mask = 0;
            while found < count {
                last += 1;
                if last >= field_count {
                    return None;
                }
                let need = (count - found).min(FIELD_BITS);
                last_mask = Self::mask(need, 0);
                if self.fields[last].load(Ordering::Relaxed) & last_mask != 0 {
                    return None;
                }
                found += need;
            }

            // claim fields in index order; on conflict undo in reverse
            let start_bit = FIELD_BITS - initial;
            let first_mask = Self::mask(initial, start_bit);

            let mut map = self.fields[idx].load(Ordering::Relaxed);
            loop {
                if map & first_mask != 0 {
                    backoff.spin();
                    continue 'retry;
                }
                match self.fields[idx].compare_exchange(
                    map,
                    map | first_mask,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => map = actual,
                }
            }

            let mut failed = None;
            let mut fld = idx + 1;
            while fld < last {
                if self.fields[fld]
                    .compare_exchange(0, FIELD_FULL, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    failed = Some(fld);
                    break;
                }
                fld += 1;
            }
            if failed.is_none() {
                let mut map = self.fields[last].load(Ordering::Relaxed);
                loop {
                    if map & last_mask != 0 {
                        failed = Some(last);
                        break;
                    }
                    match self.fields[last].compare_exchange(
                        map,
                        map | last_mask,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(actual) => map = actual,
                    }
                }
            }

            match failed {
                None => return Some(BitIndex::new(idx, start_bit)),
                Some(stop) => {
                    for mid in (idx + 1..stop).rev() {
                        self.fields[mid].store(0, Ordering::Release);
                    }
                    let mut map = self.fields[idx].load(Ordering::Relaxed);
                    loop {
                        match self.fields[idx].compare_exchange(
                            map,
                            map & !first_mask,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => break,
                            Err(actual) => map = actual,
                        }
                    }
                    backoff.spin();
                }
            }
        }
        None
    }
}
