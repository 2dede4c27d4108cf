// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host platform interface.
//!
//! Embedding hosts can override the time source and the allocator used for
//! route private-data blobs. A default-constructed [`Hpi`] uses the process
//! clock and the global allocator; the locking primitive slot of classic
//! host interfaces is covered by `std::sync` and is not overridable.

use crate::{
    error::{Error, Result},
    time::{Clock, StdClock},
};
use core::{alloc::Layout, fmt, ptr::NonNull};
use std::sync::Arc;

/// Allocator for route private-data blobs.
///
/// The engine never reads or writes the blob contents beyond zero-filling
/// on allocation; layout (size and alignment) is fixed by the context
/// configuration.
pub trait BlobAllocator: Send + Sync {
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on the same
    /// allocator with the same `layout`, and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// [`BlobAllocator`] over the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl BlobAllocator for SystemAllocator {
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(Error::InvalidArg);
        }
        // zero-filled so fresh private data reads deterministically
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(Error::OutOfMemory)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// The bundle of host-supplied services handed to
/// [`Context::new`](crate::Context::new).
#[derive(Clone)]
pub struct Hpi {
    pub clock: Arc<dyn Clock>,
    pub allocator: Arc<dyn BlobAllocator>,
}

impl Default for Hpi {
    fn default() -> Self {
        Self {
            clock: Arc::new(StdClock::default()),
            allocator: Arc::new(SystemAllocator),
        }
    }
}

impl fmt::Debug for Hpi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hpi").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_allocator_honors_layout() {
        let layout = Layout::from_size_align(64, 32).unwrap();
        let ptr = SystemAllocator.alloc(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 32, 0);
        // alloc_zeroed contract
        let slice = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(slice.iter().all(|b| *b == 0));
        unsafe { SystemAllocator.dealloc(ptr, layout) };
    }

    #[test]
    fn zero_size_is_rejected() {
        let layout = Layout::from_size_align(0, 1).unwrap();
        assert_eq!(SystemAllocator.alloc(layout), Err(Error::InvalidArg));
    }
}
