// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU32, Ordering};

/// Identity of an engine-owned entity (route, event, or action).
///
/// Ids are unique within a [`Context`](crate::Context) for its whole
/// lifetime and are never reused; a fresh context starts counting at 1.
pub type Id = u32;

#[derive(Debug)]
pub(crate) struct IdAllocator(AtomicU32);

impl IdAllocator {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn from_value(next: u32) -> Self {
        Self(AtomicU32::new(next))
    }

    #[inline]
    pub fn next(&self) -> Id {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`next`](Self::next) would return.
    #[inline]
    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_from_one() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
        assert_eq!(ids.peek(), 4);
    }

    #[test]
    fn resumes_from_value() {
        let ids = IdAllocator::from_value(17);
        assert_eq!(ids.next(), 17);
        assert_eq!(ids.next(), 18);
    }
}
