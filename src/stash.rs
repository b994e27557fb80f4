//! Ordered registry that can be addressed by position or by a matching key.
//!
//! A [`Stash`] is a plain insertion-ordered list. Lookups take any type that
//! implements [`StashKey`] for the element type: a `usize` addresses a
//! position, everything else scans for the first element it matches. This is
//! how the device registry accepts a position, a device, a name, or an id
//! without the call sites branching on the form.

use std::ops::Index;
use std::slice;

use crate::error::InputError;

/// Something a [`Stash`] can be searched with.
pub trait StashKey<T> {
    /// Position to try before scanning. Positional lookups take precedence.
    fn position(&self) -> Option<usize> {
        None
    }

    /// Equality predicate used for the scan.
    fn matches(&self, item: &T) -> bool;
}

impl<T> StashKey<T> for usize {
    fn position(&self) -> Option<usize> {
        Some(*self)
    }

    fn matches(&self, _item: &T) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stash<T> {
    items: Vec<T>,
}

impl<T> Default for Stash<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Stash<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Swaps the contents out for an empty stash.
    pub fn take(&mut self) -> Stash<T> {
        std::mem::take(self)
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    /// Resolves `key` to a position: an in-range index first, then the first match.
    pub fn position_of<Q>(&self, key: &Q) -> Option<usize>
    where
        Q: StashKey<T> + ?Sized,
    {
        if let Some(index) = key.position() {
            if index < self.items.len() {
                return Some(index);
            }
        }
        self.items.iter().position(|item| key.matches(item))
    }

    pub fn position_where<F>(&self, predicate: F) -> Option<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.items.iter().position(predicate)
    }

    pub fn get<Q>(&self, key: &Q) -> Result<&T, InputError>
    where
        Q: StashKey<T> + ?Sized,
    {
        self.position_of(key)
            .map(|index| &self.items[index])
            .ok_or_else(not_found)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Result<&mut T, InputError>
    where
        Q: StashKey<T> + ?Sized,
    {
        match self.position_of(key) {
            Some(index) => Ok(&mut self.items[index]),
            None => Err(not_found()),
        }
    }

    pub fn find<F>(&self, predicate: F) -> Option<&T>
    where
        F: FnMut(&&T) -> bool,
    {
        self.items.iter().find(predicate)
    }

    /// Replaces the element `key` resolves to.
    pub fn set<Q>(&mut self, key: &Q, value: T) -> Result<T, InputError>
    where
        Q: StashKey<T> + ?Sized,
    {
        let index = self.position_of(key).ok_or_else(not_found)?;
        Ok(std::mem::replace(&mut self.items[index], value))
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: StashKey<T> + ?Sized,
    {
        self.position_of(key).is_some()
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Result<T, InputError>
    where
        Q: StashKey<T> + ?Sized,
    {
        let index = self.position_of(key).ok_or_else(not_found)?;
        Ok(self.items.remove(index))
    }

    pub fn remove_where<F>(&mut self, predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = self.items.iter().position(predicate)?;
        Some(self.items.remove(index))
    }

    /// Removes and returns the element `key` resolves to, or `default` when
    /// nothing matches. Fails only if there is no match and no default.
    pub fn pop<Q>(&mut self, key: &Q, default: Option<T>) -> Result<T, InputError>
    where
        Q: StashKey<T> + ?Sized,
    {
        match self.position_of(key) {
            Some(index) => Ok(self.items.remove(index)),
            None => default.ok_or_else(not_found),
        }
    }
}

fn not_found() -> InputError {
    InputError::NotFound("no stash entry matches the given key".to_string())
}

impl<T> Index<usize> for Stash<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.items[index]
    }
}

impl<T> From<Vec<T>> for Stash<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T> FromIterator<T> for Stash<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T> Extend<T> for Stash<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

impl<T> IntoIterator for Stash<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Stash<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry {
        identifier: String,
        index: usize,
        value: usize,
    }

    impl StashKey<Entry> for str {
        fn matches(&self, item: &Entry) -> bool {
            item.identifier == self
        }
    }

    fn sample() -> Stash<Entry> {
        (0..3)
            .flat_map(|i| (0..3).flat_map(move |j| (0..3).map(move |k| (i, j, k))))
            .map(|(i, j, k)| Entry {
                identifier: format!("{}.{}", i, j),
                index: j,
                value: k,
            })
            .collect()
    }

    #[test]
    fn test_get_by_index_and_by_match_agree() {
        let stash = sample();
        assert!(stash.contains("0.0"));
        assert_eq!(stash.get(&0usize).unwrap(), stash.get("0.0").unwrap());
    }

    #[test]
    fn test_duplicate_matches_resolve_to_first() {
        let stash = sample();
        let found = stash.get("1.2").unwrap();
        assert_eq!(found.value, 0);
        assert_eq!(stash.position_of("1.2"), Some(15));
    }

    #[test]
    fn test_pop_and_default() {
        let mut stash = sample();
        let item = stash.pop("0.0", None).unwrap();
        assert_eq!(item.identifier, "0.0");
        assert_eq!(item.index, 0);
        assert_eq!(item.value, 0);

        assert!(matches!(
            stash.pop(&50_000_000usize, None),
            Err(InputError::NotFound(_))
        ));

        let fallback = Entry {
            identifier: "default".to_string(),
            index: 9,
            value: 9,
        };
        let popped = stash.pop(&50_000_000usize, Some(fallback.clone())).unwrap();
        assert_eq!(popped, fallback);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut stash = sample();
        let before: Vec<Entry> = stash.iter().cloned().collect();

        let removed = stash.remove("1.0").unwrap();
        assert_eq!(removed.identifier, "1.0");
        assert_eq!(removed.value, 0);
        assert_eq!(stash.len(), before.len() - 1);

        let expected: Vec<Entry> = before
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != 9)
            .map(|(_, e)| e)
            .collect();
        assert_eq!(stash.as_slice(), expected.as_slice());

        assert!(stash.remove(&50_000_000usize).is_err());
        assert!(stash.remove("9.9").is_err());
    }

    #[test]
    fn test_index_takes_precedence_over_scan() {
        let mut stash: Stash<usize> = vec![7, 3, 5].into();
        assert_eq!(*stash.get(&1usize).unwrap(), 3);
        stash.set(&0usize, 11).unwrap();
        assert_eq!(stash.as_slice(), &[11, 3, 5]);
        assert!(!stash.contains(&3usize));
    }

    #[test]
    fn test_take_leaves_empty() {
        let mut stash = sample();
        let taken = stash.take();
        assert!(stash.is_empty());
        assert_eq!(taken.len(), 27);
    }
}
