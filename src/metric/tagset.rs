//! tagset is the ordered collection of tags carried by every sample and
//! service check. Tags are opaque `key:value` strings. The set keeps itself
//! sorted and deduplicated at all times so that two submissions with the
//! same tags in a different order hash to the same aggregation context.

use std::cmp;
use std::slice::Iter;

/// A sorted, deduplicated collection of tag strings.
///
/// Behaves like a small set with a specialized implementation for fast
/// searching over a handful of entries. Because the backing vector is kept
/// sorted, derived equality, ordering and hashing are all order-insensitive
/// with respect to insertion.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet {
    inner: Vec<String>,
}

impl TagSet {
    /// Build a `TagSet` from raw tags, sorting and deduplicating.
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel::metric::TagSet;
    ///
    /// let ts = TagSet::from_slice(&["b:1".to_string(), "a:0".to_string(), "b:1".to_string()]);
    /// let flat: Vec<&str> = ts.iter().map(|t| t.as_str()).collect();
    /// assert_eq!(vec!["a:0", "b:1"], flat);
    /// ```
    pub fn from_slice(tags: &[String]) -> TagSet {
        let mut ts = TagSet::default();
        for t in tags {
            ts.insert(t.clone());
        }
        ts
    }

    /// Insert a tag, keeping sort order. Duplicates are dropped.
    pub fn insert<S>(&mut self, tag: S)
    where
        S: Into<String>,
    {
        let tag = tag.into();
        if let Err(idx) = self.inner.binary_search(&tag) {
            self.inner.insert(idx, tag);
        }
    }

    /// Remove a tag. The tag is returned if it existed.
    pub fn remove(&mut self, tag: &str) -> Option<String> {
        match self.inner.binary_search_by(|probe| probe.as_str().cmp(tag)) {
            Ok(idx) => Some(self.inner.remove(idx)),
            Err(_) => None,
        }
    }

    /// True if `tag` is present.
    pub fn contains(&self, tag: &str) -> bool {
        self.inner
            .binary_search_by(|probe| probe.as_str().cmp(tag))
            .is_ok()
    }

    /// Merge `other` into self, union semantics.
    pub fn merge(&mut self, other: &TagSet) {
        for t in other.iter() {
            self.insert(t.clone());
        }
    }

    /// Drop every tag for which `keep` returns false.
    ///
    /// Removal preserves sort order, so the set invariants hold without a
    /// re-sort.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&String) -> bool,
    {
        self.inner.retain(keep);
    }

    /// Create an iterator over the tags, in sorted order.
    pub fn iter(&self) -> Iter<String> {
        self.inner.iter()
    }

    /// The number of tags stored.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Determine if the tagset is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Consume self, yielding the sorted tags.
    pub fn into_vec(self) -> Vec<String> {
        self.inner
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a String;
    type IntoIter = Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

/// Compare two tagsets, shorter sets ordering before longer ones.
pub fn cmp(left: &TagSet, right: &TagSet) -> Option<cmp::Ordering> {
    if left.len() != right.len() {
        left.len().partial_cmp(&right.len())
    } else {
        left.inner.partial_cmp(&right.inner)
    }
}

#[cfg(test)]
mod test {
    extern crate quickcheck;

    use self::quickcheck::{QuickCheck, TestResult};
    use super::*;

    #[test]
    fn insertion_order_is_irrelevant() {
        fn inner(mut tags: Vec<String>) -> TestResult {
            let forward = TagSet::from_slice(&tags);
            tags.reverse();
            let backward = TagSet::from_slice(&tags);
            assert_eq!(forward, backward);
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(1000)
            .max_tests(10000)
            .quickcheck(inner as fn(Vec<String>) -> TestResult);
    }

    #[test]
    fn duplicates_collapse() {
        let ts = TagSet::from_slice(&[
            "role:web".to_string(),
            "role:web".to_string(),
            "az:us-east-1".to_string(),
        ]);
        assert_eq!(2, ts.len());
        assert!(ts.contains("role:web"));
        assert!(ts.contains("az:us-east-1"));
    }

    #[test]
    fn remove_keeps_order() {
        let mut ts = TagSet::from_slice(&["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(Some("b".to_string()), ts.remove("b"));
        assert_eq!(None, ts.remove("b"));
        let flat: Vec<&str> = ts.iter().map(|t| t.as_str()).collect();
        assert_eq!(vec!["a", "c"], flat);
    }
}
