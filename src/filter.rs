//! The quotient filter table and its core operations.
use crate::slot::{
    clr_continuation, clr_occupied, clr_shifted, get_remainder, is_cluster_start,
    is_continuation, is_empty_element, is_occupied, is_run_start, is_shifted, set_continuation,
    set_occupied, set_shifted, Table,
};
use crate::QuotientFilterError;
use self::iter::Iter;

/// Result of an [`insert`](QuotientFilter::insert) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The fingerprint is now present (it may already have been present).
    Inserted,
    /// The filter holds `2^q` entries already; nothing was changed.
    Full,
}

/// A quotient filter over `(q + r)`-bit fingerprints.
///
/// Canonical slot `i` is the home of every stored fingerprint whose quotient
/// is `i`. Three metadata bits per slot — `is_occupied`, `is_continuation`
/// and `is_shifted` — encode how entries have been displaced from their
/// canonical slots by earlier insertions; see the module-level notes in
/// `slot` for the bit layout and `find_run_index` below for how they are
/// read back.
#[derive(Debug, Clone)]
pub struct QuotientFilter {
    qbits: u32,
    rbits: u32,
    r_mask: u64,
    index_mask: u64,
    entries: usize,
    max_size: usize,
    table: Table,
}

impl QuotientFilter {
    /// Creates an empty filter with `2^q` canonical slots and `r`-bit
    /// remainders. Fails if `q == 0`, `r == 0`, or `q + r > 64`.
    pub fn new(q: u32, r: u32) -> anyhow::Result<Self> {
        if q == 0 || r == 0 || q + r > 64 {
            return Err(anyhow::Error::new(QuotientFilterError::InvalidParameters { q, r }));
        }

        let m = 1usize << q;
        let elem_bits = r + 3;
        let r_mask = if r >= 64 { u64::MAX } else { (1u64 << r) - 1 };

        Ok(Self {
            qbits: q,
            rbits: r,
            r_mask,
            index_mask: (m - 1) as u64,
            entries: 0,
            max_size: m,
            table: Table::new(m, elem_bits),
        })
    }

    /// Number of quotient bits (`q`).
    pub fn quotient_bits(&self) -> u32 {
        self.qbits
    }

    /// Number of remainder bits (`r`).
    pub fn remainder_bits(&self) -> u32 {
        self.rbits
    }

    /// Number of canonical slots, `2^q`.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Number of fingerprints currently stored.
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn is_full(&self) -> bool {
        self.entries >= self.max_size
    }

    /// Byte size of the bit-packed table for a filter with these parameters,
    /// independent of any particular instance. Does not include the word
    /// count and entry count stored alongside the table.
    pub fn table_size(q: u32, r: u32) -> usize {
        let m = 1u64 << q;
        let bits = m * (r as u64 + 3);
        ((bits + 7) / 8) as usize
    }

    /// Actual number of bytes backing this instance's table (word-aligned,
    /// so it may be slightly larger than `table_size(q, r)`).
    pub fn space_bytes(&self) -> usize {
        self.table.byte_len()
    }

    /// Poisson-model estimate of the false-positive rate at the filter's
    /// current load. Increases monotonically with `entries()`.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let n = self.entries as f64;
        let p = (self.qbits + self.rbits) as f64;
        1.0 - (-n / 2f64.powf(p)).exp()
    }

    /// Zeroes the table. Does not release the backing allocation.
    pub fn clear(&mut self) {
        self.table.clear();
        self.entries = 0;
    }

    /// Inserts the fingerprint carried in the low `q + r` bits of `hash`.
    /// Idempotent: inserting the same fingerprint twice is a no-op the
    /// second time.
    pub fn insert(&mut self, hash: u64) -> InsertOutcome {
        if self.entries >= self.max_size {
            return InsertOutcome::Full;
        }

        let fq = self.hash_to_quotient(hash);
        let fr = self.hash_to_remainder(hash);
        let t_fq = self.get_elem(fq);
        let mut entry = fr << 3;

        // Special-case filling canonical slots to simplify insert_into.
        if is_empty_element(t_fq) {
            self.set_elem(fq, set_occupied(entry));
            self.entries += 1;
            return InsertOutcome::Inserted;
        }

        if !is_occupied(t_fq) {
            self.set_elem(fq, set_occupied(t_fq));
        }

        let start = self.find_run_index(fq);
        let mut s = start;

        if is_occupied(t_fq) {
            // Move the cursor to the insert position within fq's run.
            loop {
                let rem = get_remainder(self.get_elem(s));
                if rem == fr {
                    return InsertOutcome::Inserted;
                } else if rem > fr {
                    break;
                }
                s = self.incr(s);
                if !is_continuation(self.get_elem(s)) {
                    break;
                }
            }

            if s == start {
                // The old start-of-run becomes a continuation.
                let old_head = self.get_elem(start);
                self.set_elem(start, set_continuation(old_head));
            } else {
                entry = set_continuation(entry);
            }
        }

        if s != fq {
            entry = set_shifted(entry);
        }

        self.insert_into(s, entry);
        self.entries += 1;
        InsertOutcome::Inserted
    }

    /// Returns `true` if the fingerprint may be present. Never a false
    /// negative for a fingerprint actually inserted with a hash that fits
    /// in `q + r` bits.
    pub fn may_contain(&self, hash: u64) -> bool {
        let fq = self.hash_to_quotient(hash);
        let fr = self.hash_to_remainder(hash);
        let t_fq = self.get_elem(fq);

        if !is_occupied(t_fq) {
            return false;
        }

        let mut s = self.find_run_index(fq);
        loop {
            let rem = get_remainder(self.get_elem(s));
            if rem == fr {
                return true;
            } else if rem > fr {
                return false;
            }
            s = self.incr(s);
            if !is_continuation(self.get_elem(s)) {
                return false;
            }
        }
    }

    /// Removes the fingerprint carried in the low `q + r` bits of `hash`.
    ///
    /// Fails if `hash` has bits set above position `q + r - 1`. Removing an
    /// absent fingerprint is a no-op, not an error: if two inserted hashes
    /// share the same low `q + r` bits, the second insert was already a
    /// no-op, so removing either one will make both untraceable — always
    /// feed hashes no wider than `q + r` bits if deletion is in use.
    pub fn remove(&mut self, hash: u64) -> anyhow::Result<()> {
        let q_plus_r = self.qbits + self.rbits;
        let highbits = if q_plus_r >= 64 { 0 } else { hash >> q_plus_r };
        if highbits != 0 {
            return Err(anyhow::Error::new(QuotientFilterError::HashTooWide { q_plus_r }));
        }

        let fq = self.hash_to_quotient(hash);
        let fr = self.hash_to_remainder(hash);
        let mut t_fq = self.get_elem(fq);

        if !is_occupied(t_fq) || self.entries == 0 {
            return Ok(());
        }

        let start = self.find_run_index(fq);
        let mut s = start;
        let mut rem;
        loop {
            rem = get_remainder(self.get_elem(s));
            if rem == fr {
                break;
            } else if rem > fr {
                return Ok(());
            }
            s = self.incr(s);
            if !is_continuation(self.get_elem(s)) {
                break;
            }
        }
        if rem != fr {
            return Ok(());
        }

        let kill = if s == fq { t_fq } else { self.get_elem(s) };
        let replace_run_start = is_run_start(kill);

        // If we're deleting the only entry in a run, clear is_occupied.
        if replace_run_start {
            let next = self.get_elem(self.incr(s));
            if !is_continuation(next) {
                t_fq = clr_occupied(t_fq);
                self.set_elem(fq, t_fq);
            }
        }

        self.delete_entry(s, fq);

        if replace_run_start {
            let next = self.get_elem(s);
            let mut updated_next = next;
            if is_continuation(next) {
                updated_next = clr_continuation(next);
            }
            if s == fq && is_run_start(updated_next) {
                updated_next = clr_shifted(updated_next);
            }
            if updated_next != next {
                self.set_elem(s, updated_next);
            }
        }

        self.entries -= 1;
        Ok(())
    }

    /// Creates a fresh filter sized to hold both `a` and `b`, then copies
    /// every fingerprint from each into it. The merged filter uses
    /// `q' = 1 + max(q_a, q_b)` and `r' = max(r_a, r_b)`, which always has
    /// enough capacity for `a.entries() + b.entries()`.
    pub fn merge(a: &QuotientFilter, b: &QuotientFilter) -> anyhow::Result<QuotientFilter> {
        let q = 1 + a.qbits.max(b.qbits);
        let r = a.rbits.max(b.rbits);
        let mut out = QuotientFilter::new(q, r)?;
        for fp in a.iter() {
            out.insert(fp);
        }
        for fp in b.iter() {
            out.insert(fp);
        }
        Ok(out)
    }

    /// Iterates stored fingerprints in canonical-slot (cluster) order.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }

    fn hash_to_quotient(&self, hash: u64) -> u64 {
        (hash >> self.rbits) & self.index_mask
    }

    fn hash_to_remainder(&self, hash: u64) -> u64 {
        hash & self.r_mask
    }

    pub(crate) fn get_elem(&self, i: u64) -> u64 {
        self.table.get_elem(i as usize)
    }

    pub(crate) fn set_elem(&mut self, i: u64, elt: u64) {
        self.table.set_elem(i as usize, elt)
    }

    pub(crate) fn incr(&self, i: u64) -> u64 {
        (i + 1) & self.index_mask
    }

    fn decr(&self, i: u64) -> u64 {
        i.wrapping_sub(1) & self.index_mask
    }

    /// Finds the start index of the run for `fq`, given that `fq`'s
    /// canonical slot has `is_occupied` set.
    ///
    /// Walks `b` back to the start of the cluster containing `fq`, then
    /// walks `s` forward one run at a time (skipping continuations) while
    /// `b` walks forward one occupied slot at a time, until `b` reaches
    /// `fq` — at that point `s` is sitting on `fq`'s run.
    fn find_run_index(&self, fq: u64) -> u64 {
        let mut b = fq;
        while is_shifted(self.get_elem(b)) {
            b = self.decr(b);
        }

        let mut s = b;
        while b != fq {
            loop {
                s = self.incr(s);
                if !is_continuation(self.get_elem(s)) {
                    break;
                }
            }
            loop {
                b = self.incr(b);
                if is_occupied(self.get_elem(b)) {
                    break;
                }
            }
        }
        s
    }

    /// Writes `elt` into slot `s`, shifting every subsequent occupied slot
    /// forward by one to make room. `is_occupied` stays with the slot
    /// address it started at, not with the value being shifted through it —
    /// everything else rides along with the entry.
    fn insert_into(&mut self, s: u64, elt: u64) {
        let mut s = s;
        let mut curr = elt;
        loop {
            let mut prev = self.get_elem(s);
            let empty = is_empty_element(prev);
            if !empty {
                prev = set_shifted(prev);
                if is_occupied(prev) {
                    curr = set_occupied(curr);
                    prev = clr_occupied(prev);
                }
            }
            self.set_elem(s, curr);
            curr = prev;
            s = self.incr(s);
            if empty {
                break;
            }
        }
    }

    /// Removes the entry at `s` and slides the rest of its cluster back by
    /// one slot. `quot` tracks the canonical slot of whatever currently
    /// occupies `s`, so that an entry sliding back into its own canonical
    /// slot can have its `is_shifted` bit cleared.
    fn delete_entry(&mut self, s: u64, quot: u64) {
        let mut s = s;
        let mut sp = self.incr(s);
        let orig = s;
        let mut curr = self.get_elem(s);
        let mut quot = quot;

        loop {
            let next = self.get_elem(sp);
            let curr_occupied = is_occupied(curr);

            if is_empty_element(next) || is_cluster_start(next) || sp == orig {
                self.set_elem(s, 0);
                return;
            }

            let mut updated_next = next;
            if is_run_start(next) {
                loop {
                    quot = self.incr(quot);
                    if is_occupied(self.get_elem(quot)) {
                        break;
                    }
                }
                if curr_occupied && quot == s {
                    updated_next = clr_shifted(next);
                }
            }

            self.set_elem(
                s,
                if curr_occupied {
                    set_occupied(updated_next)
                } else {
                    clr_occupied(updated_next)
                },
            );

            s = sp;
            sp = self.incr(sp);
            curr = next;
        }
    }
}

impl<'a> IntoIterator for &'a QuotientFilter {
    type Item = u64;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

pub(crate) mod iter {
    use super::QuotientFilter;
    use crate::slot::{get_remainder, is_cluster_start, is_empty_element, is_occupied, is_run_start};

    /// Cursor yielding stored `(q + r)`-bit fingerprints in cluster order.
    ///
    /// Borrows the filter for its whole lifetime, which is the Rust
    /// equivalent of the "do not mutate the table while iterating, and the
    /// filter must outlive the iterator" contract: both are enforced by the
    /// borrow checker instead of by caller discipline.
    pub struct Iter<'a> {
        filter: &'a QuotientFilter,
        index: u64,
        quotient: u64,
        visited: usize,
    }

    impl<'a> Iter<'a> {
        pub(super) fn new(filter: &'a QuotientFilter) -> Self {
            if filter.entries == 0 {
                return Self { filter, index: 0, quotient: 0, visited: filter.entries };
            }

            let mut start = 0u64;
            while start < filter.max_size as u64 {
                if is_cluster_start(filter.get_elem(start)) {
                    break;
                }
                start += 1;
            }

            Self { filter, index: start, quotient: start, visited: 0 }
        }
    }

    impl<'a> Iterator for Iter<'a> {
        type Item = u64;

        fn next(&mut self) -> Option<u64> {
            while self.visited < self.filter.entries {
                let elt = self.filter.get_elem(self.index);

                if is_cluster_start(elt) {
                    self.quotient = self.index;
                } else if is_run_start(elt) {
                    let mut q = self.quotient;
                    loop {
                        q = self.filter.incr(q);
                        if is_occupied(self.filter.get_elem(q)) {
                            break;
                        }
                    }
                    self.quotient = q;
                }

                self.index = self.filter.incr(self.index);

                if !is_empty_element(elt) {
                    let fingerprint = (self.quotient << self.filter.rbits) | get_remainder(elt);
                    self.visited += 1;
                    return Some(fingerprint);
                }
            }
            None
        }

        fn size_hint(&self) -> (usize, Option<usize>) {
            let remaining = self.filter.entries - self.visited;
            (remaining, Some(remaining))
        }
    }

    impl<'a> ExactSizeIterator for Iter<'a> {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, Rng, SeedableRng};

    #[test]
    fn rejects_bad_parameters() {
        assert!(QuotientFilter::new(0, 4).is_err());
        assert!(QuotientFilter::new(4, 0).is_err());
        assert!(QuotientFilter::new(40, 30).is_err());
        // q + r == 64 is the allowed boundary; keep q small so the table stays tiny.
        assert!(QuotientFilter::new(4, 60).is_ok());
    }

    #[test]
    fn scenario_basic_membership() {
        let mut qf = QuotientFilter::new(3, 4).unwrap();
        for h in [0x00u64, 0x01, 0x10, 0x11, 0x20] {
            assert_eq!(qf.insert(h), InsertOutcome::Inserted);
        }
        for h in [0x00u64, 0x01, 0x10, 0x11, 0x20] {
            assert!(qf.may_contain(h));
        }
        for h in [0x02u64, 0x12, 0x21] {
            assert!(!qf.may_contain(h));
        }
        assert_eq!(qf.entries(), 5);
    }

    #[test]
    fn scenario_duplicate_insert_then_remove() {
        let mut qf = QuotientFilter::new(4, 4).unwrap();
        qf.insert(0x00);
        qf.insert(0x00);
        assert_eq!(qf.entries(), 1);
        assert!(qf.may_contain(0x00));
        qf.remove(0x00).unwrap();
        assert!(!qf.may_contain(0x00));
        assert_eq!(qf.entries(), 0);
    }

    #[test]
    fn scenario_long_run_insert_and_reverse_remove() {
        let mut qf = QuotientFilter::new(4, 4).unwrap();
        let hashes: Vec<u64> = (0..16).map(|r| (3u64 << 4) | r).collect();
        for &h in &hashes {
            assert_eq!(qf.insert(h), InsertOutcome::Inserted);
            for &check in &hashes {
                if check <= h {
                    assert!(qf.may_contain(check));
                }
            }
        }
        assert_eq!(qf.entries(), 16);

        for &h in hashes.iter().rev() {
            qf.remove(h).unwrap();
        }
        assert_eq!(qf.entries(), 0);
        for &h in &hashes {
            assert!(!qf.may_contain(h));
        }
    }

    #[test]
    fn scenario_iterator_round_trip_at_load() {
        let mut qf = QuotientFilter::new(6, 6).unwrap();
        let target = (qf.capacity() * 3) / 4;
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut inserted = std::collections::HashSet::new();
        while inserted.len() < target {
            let h: u64 = rng.gen_range(0..(1u64 << 12));
            if qf.may_contain(h) {
                continue;
            }
            qf.insert(h);
            inserted.insert(h);
        }

        let collected: Vec<u64> = qf.iter().collect();
        assert_eq!(collected.len(), qf.entries());
        let as_set: std::collections::HashSet<u64> = collected.iter().copied().collect();
        assert_eq!(as_set, inserted);

        let mut replayed = QuotientFilter::new(6, 6).unwrap();
        for fp in &collected {
            replayed.insert(*fp);
        }
        let replayed_set: std::collections::HashSet<u64> = replayed.iter().collect();
        assert_eq!(replayed_set, as_set);
    }

    #[test]
    fn scenario_merge_covers_union_of_disjoint_sets() {
        let mut a = QuotientFilter::new(3, 5).unwrap();
        let mut b = QuotientFilter::new(3, 5).unwrap();
        let a_items: Vec<u64> = (0..6).collect();
        let b_items: Vec<u64> = (100..106).collect();
        for &h in &a_items {
            a.insert(h);
        }
        for &h in &b_items {
            b.insert(h);
        }

        let c = QuotientFilter::merge(&a, &b).unwrap();
        assert_eq!(c.entries(), a.entries() + b.entries());
        for &h in a_items.iter().chain(b_items.iter()) {
            assert!(c.may_contain(h));
        }

        let union: std::collections::HashSet<u64> =
            a_items.iter().chain(b_items.iter()).copied().collect();
        let from_c: std::collections::HashSet<u64> = c.iter().collect();
        assert_eq!(from_c, union);
    }

    #[test]
    fn scenario_full_filter_rejects_insert() {
        let mut qf = QuotientFilter::new(1, 1).unwrap();
        assert_eq!(qf.insert(0b00), InsertOutcome::Inserted);
        assert_eq!(qf.insert(0b01), InsertOutcome::Inserted);
        assert_eq!(qf.insert(0b10), InsertOutcome::Inserted);
        assert_eq!(qf.insert(0b11), InsertOutcome::Inserted);
        assert_eq!(qf.insert(0b00), InsertOutcome::Full);
    }

    #[test]
    fn remove_rejects_oversize_hash() {
        let mut qf = QuotientFilter::new(4, 4).unwrap();
        let err = qf.remove(1 << 8).unwrap_err();
        assert!(err.to_string().contains("more than q+r"));
    }

    #[test]
    fn remove_preserves_other_entries() {
        let mut qf = QuotientFilter::new(4, 4).unwrap();
        let kept: Vec<u64> = vec![1, 2, 3, 4, 5];
        for &h in &kept {
            qf.insert(h);
        }
        qf.remove(6).unwrap(); // never inserted: no-op
        for &h in &kept {
            assert!(qf.may_contain(h));
        }
        let from_iter: std::collections::HashSet<u64> = qf.iter().collect();
        assert_eq!(from_iter, kept.into_iter().collect());
    }

    #[test]
    fn stress_insert_shuffle_remove_all() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let qbits = 8u32;
        let rbits = 24u32;
        let mut qf = QuotientFilter::new(qbits, rbits).unwrap();

        let mut items = Vec::new();
        for _ in 0..(qf.capacity() * 3 / 4) {
            let mut item: u64 = rng.gen_range(0..(1u64 << (qbits + rbits)));
            while qf.may_contain(item) {
                item = rng.gen_range(0..(1u64 << (qbits + rbits)));
            }
            assert_eq!(qf.insert(item), InsertOutcome::Inserted);
            items.push(item);
        }
        assert_eq!(qf.entries(), items.len());

        items.shuffle(&mut rng);
        for item in items {
            assert!(qf.may_contain(item));
            qf.remove(item).unwrap();
            assert!(!qf.may_contain(item));
        }
        assert_eq!(qf.entries(), 0);
    }

    #[test]
    fn table_size_matches_formula() {
        // m=16 slots, elem_bits=4+3=7 -> 112 bits -> 14 bytes
        assert_eq!(QuotientFilter::table_size(4, 4), 14);
    }

    #[test]
    fn space_bytes_is_at_least_the_formula_size() {
        let qf = QuotientFilter::new(4, 4).unwrap();
        assert!(qf.space_bytes() >= QuotientFilter::table_size(4, 4));
    }

    #[test]
    fn estimated_fpr_increases_with_load() {
        let mut qf = QuotientFilter::new(6, 6).unwrap();
        let empty_fpr = qf.estimated_false_positive_rate();
        for i in 0..40u64 {
            qf.insert(i);
        }
        assert!(qf.estimated_false_positive_rate() > empty_fpr);
    }
}
