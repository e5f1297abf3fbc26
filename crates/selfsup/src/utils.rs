//! Singleton-or-list normalization.
//!
//! Some checkpoint writers collapse a one-element list to a bare value.
//! [`OneOrMany`] accepts both shapes on read and always exposes indexable
//! access, so the rest of the crate only ever deals with lists.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainingError};

/// Either a single item or a list of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// An explicit list.
    Many(Vec<T>),
    /// A bare value, treated as a one-element list.
    One(T),
}

impl<T> OneOrMany<T> {
    /// Number of items (1 for a singleton).
    pub fn len(&self) -> usize {
        match self {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`.
    ///
    /// Out of range: `Err(IndexOutOfRange)` when `fail_if_out_of_range`,
    /// otherwise `Ok(None)`.
    pub fn get(&self, index: usize, fail_if_out_of_range: bool) -> Result<Option<&T>> {
        let item = match self {
            OneOrMany::One(item) if index == 0 => Some(item),
            OneOrMany::One(_) => None,
            OneOrMany::Many(items) => items.get(index),
        };
        match item {
            Some(item) => Ok(Some(item)),
            None if fail_if_out_of_range => Err(TrainingError::IndexOutOfRange {
                index,
                len: self.len(),
            }),
            None => Ok(None),
        }
    }

    /// Flatten into a list.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(items: Vec<T>) -> Self {
        OneOrMany::Many(items)
    }
}

/// Free-function form of [`OneOrMany::get`].
pub fn get_from_list_or_singleton<T>(
    items: &OneOrMany<T>,
    index: usize,
    fail_if_out_of_range: bool,
) -> Result<Option<&T>> {
    items.get(index, fail_if_out_of_range)
}
