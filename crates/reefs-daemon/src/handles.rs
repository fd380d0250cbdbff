// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Owned `handle -> resource` tables
//!
//! Handles are positive and allocated from a monotonic counter; after
//! wrapping the counter skips any handle still in use, so a live handle is
//! never handed out twice.

use std::collections::BTreeMap;

use crate::error::{ReefsError, ReefsResult};

pub const DEFAULT_HANDLE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct HandleTable<T> {
    entries: BTreeMap<i32, T>,
    next: i32,
    capacity: usize,
}

impl<T> HandleTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next: 1,
            capacity,
        }
    }

    /// Register a resource. On failure the resource is dropped here, so a
    /// caller never ends up with an open but unregistered resource.
    pub fn insert(&mut self, value: T) -> ReefsResult<i32> {
        if self.entries.len() >= self.capacity {
            return Err(ReefsError::HandlesExhausted);
        }
        let handle = loop {
            let candidate = self.next;
            self.next = if self.next == i32::MAX { 1 } else { self.next + 1 };
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        self.entries.insert(handle, value);
        Ok(handle)
    }

    pub fn get_mut(&mut self, handle: i32) -> ReefsResult<&mut T> {
        self.entries
            .get_mut(&handle)
            .ok_or(ReefsError::InvalidHandle(handle))
    }

    pub fn remove(&mut self, handle: i32) -> ReefsResult<T> {
        self.entries
            .remove(&handle)
            .ok_or(ReefsError::InvalidHandle(handle))
    }

    /// Drop every resource; outstanding handles become invalid
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLE_CAPACITY)
    }
}
