//! The variable association table.
//!
//! Scopes are created and destroyed for every promise evaluated, so the
//! table is bimodal: a flat array with linear search up to [`TINY_LIMIT`]
//! entries, converted to a fixed-capacity open-addressed hash table on the
//! insertion after that. The conversion is one-way. For typical
//! promise-local variable counts the flat array beats the hash table on
//! both allocation and lookup cost.

use converge_core::constants::{HASH_TABLE_SIZE, TINY_LIMIT};
use converge_core::rval::{DataType, Rval};

/// One `lval => (rval, datatype)` binding. The lval is unique within a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub lval: String,
    pub rval: Rval,
    pub dtype: DataType,
}

impl Association {
    pub fn new<S: Into<String>>(lval: S, rval: Rval, dtype: DataType) -> Self {
        Self {
            lval: lval.into(),
            rval,
            dtype,
        }
    }
}

/// Open-addressing bucket state. Deletion leaves a tombstone that lookups
/// skip but insertion may reuse.
#[derive(Debug, Clone)]
enum Bucket {
    Empty,
    Tombstone,
    Occupied(Association),
}

#[derive(Debug)]
enum Repr {
    Tiny(Vec<Association>),
    Huge(Vec<Bucket>),
}

/// Adaptive mapping from variable name to association
#[derive(Debug)]
pub struct AssocTable {
    repr: Repr,
}

/// One-at-a-time hash over the ASCII-lowercased key, masked to the table
/// size. Only the hash input is folded; stored keys keep their case.
fn hash_of(key: &str) -> usize {
    let mut h: u32 = 0;
    for &b in key.as_bytes() {
        h = h.wrapping_add(b.to_ascii_lowercase() as u32);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h = h.wrapping_add(h << 15);
    (h as usize) & (HASH_TABLE_SIZE - 1)
}

impl AssocTable {
    /// Creates an empty table in the tiny representation
    pub fn new() -> Self {
        Self {
            repr: Repr::Tiny(Vec::new()),
        }
    }

    /// Inserts a binding, cloning the rvalue in. Returns false when the key
    /// is already present (no overwrite) or the huge table is full.
    pub fn insert(&mut self, lval: &str, rval: &Rval, dtype: DataType) -> bool {
        match &mut self.repr {
            Repr::Tiny(entries) => {
                if entries.len() == TINY_LIMIT {
                    self.convert_to_huge();
                    return self.insert(lval, rval, dtype);
                }
                if entries.iter().any(|a| a.lval == lval) {
                    return false;
                }
                entries.push(Association::new(lval, rval.clone(), dtype));
                true
            }
            Repr::Huge(buckets) => huge_insert(buckets, Association::new(lval, rval.clone(), dtype)),
        }
    }

    /// Case-sensitive exact-match lookup
    pub fn lookup(&self, lval: &str) -> Option<&Association> {
        match &self.repr {
            Repr::Tiny(entries) => entries.iter().find(|a| a.lval == lval),
            Repr::Huge(buckets) => huge_probe(buckets, lval).map(|i| match &buckets[i] {
                Bucket::Occupied(a) => a,
                _ => unreachable!("probe returned a live bucket"),
            }),
        }
    }

    /// Mutable lookup, for in-place replacement of an existing binding
    pub fn lookup_mut(&mut self, lval: &str) -> Option<&mut Association> {
        match &mut self.repr {
            Repr::Tiny(entries) => entries.iter_mut().find(|a| a.lval == lval),
            Repr::Huge(buckets) => {
                let idx = huge_probe(buckets, lval)?;
                match &mut buckets[idx] {
                    Bucket::Occupied(a) => Some(a),
                    _ => unreachable!("probe returned a live bucket"),
                }
            }
        }
    }

    /// Deletes a binding. In the tiny representation the tail shifts down;
    /// in the huge one a tombstone is written.
    pub fn delete(&mut self, lval: &str) -> bool {
        match &mut self.repr {
            Repr::Tiny(entries) => {
                if let Some(pos) = entries.iter().position(|a| a.lval == lval) {
                    entries.remove(pos);
                    true
                } else {
                    false
                }
            }
            Repr::Huge(buckets) => {
                if let Some(idx) = huge_probe(buckets, lval) {
                    buckets[idx] = Bucket::Tombstone;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Destroys every binding. The representation is kept: a huge table
    /// stays huge.
    pub fn clear(&mut self) {
        match &mut self.repr {
            Repr::Tiny(entries) => entries.clear(),
            Repr::Huge(buckets) => {
                for bucket in buckets.iter_mut() {
                    *bucket = Bucket::Empty;
                }
            }
        }
    }

    /// Re-inserts every live entry of `other` through the logical insert,
    /// so key uniqueness is respected and the first key wins. The iterator
    /// never yields tombstones, so a tombstone in `other` cannot shadow a
    /// live binding during the copy.
    pub fn copy_from(&mut self, other: &AssocTable) {
        for assoc in other.iter() {
            self.insert(&assoc.lval, &assoc.rval, assoc.dtype);
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Tiny(entries) => entries.len(),
            Repr::Huge(buckets) => buckets
                .iter()
                .filter(|b| matches!(b, Bucket::Occupied(_)))
                .count(),
        }
    }

    /// Whether the table has no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits each live association exactly once. Insertion order in the
    /// tiny representation, bucket order in the huge one.
    pub fn iter(&self) -> impl Iterator<Item = &Association> {
        let (tiny, huge) = match &self.repr {
            Repr::Tiny(entries) => (Some(entries.iter()), None),
            Repr::Huge(buckets) => (None, Some(buckets.iter())),
        };
        tiny.into_iter().flatten().chain(
            huge.into_iter()
                .flatten()
                .filter_map(|bucket| match bucket {
                    Bucket::Occupied(a) => Some(a),
                    _ => None,
                }),
        )
    }

    fn convert_to_huge(&mut self) {
        let entries = match &mut self.repr {
            Repr::Tiny(entries) => std::mem::take(entries),
            Repr::Huge(_) => return,
        };
        let mut buckets = vec![Bucket::Empty; HASH_TABLE_SIZE];
        for assoc in entries {
            // Keys are already unique and the table cannot be full here
            let mut i = hash_of(&assoc.lval);
            loop {
                if matches!(buckets[i], Bucket::Empty) {
                    buckets[i] = Bucket::Occupied(assoc);
                    break;
                }
                i = (i + 1) % HASH_TABLE_SIZE;
            }
        }
        self.repr = Repr::Huge(buckets);
    }
}

impl Default for AssocTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Probes for a live bucket holding `lval`. Stops at the first empty bucket
/// or after one full revolution.
fn huge_probe(buckets: &[Bucket], lval: &str) -> Option<usize> {
    let start = hash_of(lval);
    let mut i = start;
    loop {
        match &buckets[i] {
            Bucket::Empty => return None,
            Bucket::Occupied(a) if a.lval == lval => return Some(i),
            _ => {}
        }
        i = (i + 1) % HASH_TABLE_SIZE;
        if i == start {
            return None;
        }
    }
}

/// Inserts into the first reusable bucket on the probe path. A duplicate
/// occupied key refuses the insert; a full revolution means the table is
/// full and the insert fails.
fn huge_insert(buckets: &mut [Bucket], assoc: Association) -> bool {
    let start = hash_of(&assoc.lval);
    let mut i = start;
    loop {
        match &buckets[i] {
            Bucket::Empty | Bucket::Tombstone => {
                buckets[i] = Bucket::Occupied(assoc);
                return true;
            }
            Bucket::Occupied(existing) if existing.lval == assoc.lval => return false,
            _ => {}
        }
        i = (i + 1) % HASH_TABLE_SIZE;
        if i == start {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::rval::Rval;
    use proptest::prelude::*;

    fn scalar(v: &str) -> Rval {
        Rval::scalar(v)
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = AssocTable::new();
        assert!(table.insert("alpha", &scalar("1"), DataType::String));
        assert!(!table.insert("alpha", &scalar("2"), DataType::String));

        let found = table.lookup("alpha").expect("key present");
        assert_eq!(found.rval, scalar("1"));
        assert!(table.lookup("Alpha").is_none(), "lookup is case-sensitive");
    }

    #[test]
    fn test_tiny_preserves_insertion_order() {
        let mut table = AssocTable::new();
        for key in ["one", "two", "three"] {
            table.insert(key, &scalar(key), DataType::String);
        }
        let order: Vec<&str> = table.iter().map(|a| a.lval.as_str()).collect();
        assert_eq!(order, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_transition_to_huge_preserves_contents() {
        let mut table = AssocTable::new();
        let keys: Vec<String> = (0..15).map(|i| format!("key_{}", i)).collect();
        for key in &keys {
            assert!(table.insert(key, &scalar(key), DataType::String));
        }

        assert_eq!(table.len(), 15);
        let mut seen: Vec<&str> = table.iter().map(|a| a.lval.as_str()).collect();
        seen.sort_unstable();
        let mut expected: Vec<&str> = keys.iter().map(String::as_str).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);

        for key in &keys {
            assert_eq!(
                table.lookup(key).expect("key survives conversion").rval,
                scalar(key)
            );
        }
    }

    #[test]
    fn test_delete_then_insert_reuses_tombstone() {
        let mut table = AssocTable::new();
        let n = 20; // forces the huge representation
        for i in 0..n {
            table.insert(&format!("key_{}", i), &scalar("v"), DataType::String);
        }
        assert!(table.delete("key_7"));
        assert!(table.insert("fresh_key", &scalar("w"), DataType::String));
        assert!(table.len() >= n);
        assert!(table.lookup("key_7").is_none());
        assert_eq!(table.lookup("fresh_key").expect("present").rval, scalar("w"));
    }

    #[test]
    fn test_tiny_delete_shifts_tail() {
        let mut table = AssocTable::new();
        for key in ["a", "b", "c"] {
            table.insert(key, &scalar(key), DataType::String);
        }
        assert!(table.delete("b"));
        assert!(!table.delete("b"));
        let order: Vec<&str> = table.iter().map(|a| a.lval.as_str()).collect();
        assert_eq!(order, vec!["a", "c"]);
    }

    #[test]
    fn test_copy_from_respects_existing_keys() {
        let mut src = AssocTable::new();
        src.insert("x", &scalar("src"), DataType::String);
        src.insert("y", &scalar("src"), DataType::String);

        let mut dst = AssocTable::new();
        dst.insert("x", &scalar("dst"), DataType::String);
        dst.copy_from(&src);

        assert_eq!(dst.lookup("x").expect("present").rval, scalar("dst"));
        assert_eq!(dst.lookup("y").expect("present").rval, scalar("src"));
    }

    #[test]
    fn test_copy_skips_tombstones() {
        let mut src = AssocTable::new();
        for i in 0..20 {
            src.insert(&format!("key_{}", i), &scalar("v"), DataType::String);
        }
        src.delete("key_3");

        let mut dst = AssocTable::new();
        dst.copy_from(&src);
        assert_eq!(dst.len(), 19);
        assert!(dst.lookup("key_3").is_none());
    }

    #[test]
    fn test_clear_keeps_representation_usable() {
        let mut table = AssocTable::new();
        for i in 0..20 {
            table.insert(&format!("key_{}", i), &scalar("v"), DataType::String);
        }
        table.clear();
        assert!(table.is_empty());
        assert!(table.insert("again", &scalar("v"), DataType::String));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_refuses_insert() {
        let mut table = AssocTable::new();
        for i in 0..HASH_TABLE_SIZE {
            assert!(table.insert(&format!("key_{}", i), &scalar("v"), DataType::String));
        }
        assert!(!table.insert("one_too_many", &scalar("v"), DataType::String));
        assert_eq!(table.len(), HASH_TABLE_SIZE);
    }

    proptest! {
        #[test]
        fn prop_round_trip(keys in proptest::collection::hash_set("[a-zA-Z_][a-zA-Z0-9_]{0,16}", 1..80)) {
            let mut table = AssocTable::new();
            for key in &keys {
                prop_assert!(table.insert(key, &scalar(key), DataType::String));
            }
            for key in &keys {
                let found = table.lookup(key).expect("inserted key must be found");
                prop_assert_eq!(found.rval.as_scalar().expect("scalar"), key.as_str());
            }
            prop_assert_eq!(table.len(), keys.len());
            prop_assert_eq!(table.iter().count(), keys.len());
        }
    }
}
