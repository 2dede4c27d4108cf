// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Routes: endpoint-pair patterns with per-field wildcards.
//!
//! A route is a pattern, not a path. Each wildcard flag declares one key
//! field unconstrained; the field must then be zero on insert. Matching
//! prefers the most specific candidate (see [`table`]), and dispatch
//! reports which wildcard bits it had to rely on as the query's
//! *inexact matches*.

pub mod table;

pub use table::RouteCursor;

use crate::{
    error::{Error, Result},
    hpi::BlobAllocator,
    id::Id,
    inet::Endpoint,
    label::Label,
    macros::bitset,
    time::Timestamp,
};
use core::{
    alloc::Layout,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use std::sync::Arc;

bitset!(
    /// Route attribute and wildcard bits.
    ///
    /// The direction and wildcard bits identify a route within its table;
    /// the disposition bits (`GREENLISTED`/`PENALTYBOXED`) and
    /// `TCPLIKE_PORT_NUMBERS` do not, and remain updatable after insert.
    pub struct RouteFlags(u32);

    /// Route applies to inbound flows.
    const DIRECTION_IN = 1 << 0;
    /// Route applies to outbound flows.
    const DIRECTION_OUT = 1 << 1;
    /// Matching flows are accepted.
    const GREENLISTED = 1 << 2;
    /// Matching flows are rejected. Mutually exclusive with `GREENLISTED`.
    const PENALTYBOXED = 1 << 3;
    /// Hint that the port numbers follow TCP/UDP conventions.
    const TCPLIKE_PORT_NUMBERS = 1 << 4;
    const FAMILY_WILDCARD = 1 << 5;
    const PROTO_WILDCARD = 1 << 6;
    const REMOTE_ADDR_WILDCARD = 1 << 7;
    const LOCAL_ADDR_WILDCARD = 1 << 8;
    const REMOTE_PORT_WILDCARD = 1 << 9;
    const LOCAL_PORT_WILDCARD = 1 << 10;
    const REMOTE_INTERFACE_WILDCARD = 1 << 11;
    const LOCAL_INTERFACE_WILDCARD = 1 << 12;
);

impl RouteFlags {
    pub const DIRECTION_MASK: Self = Self::DIRECTION_IN.union(Self::DIRECTION_OUT);
    pub const DISPOSITION_MASK: Self = Self::GREENLISTED.union(Self::PENALTYBOXED);
    pub const WILDCARD_MASK: Self = Self::FAMILY_WILDCARD
        .union(Self::PROTO_WILDCARD)
        .union(Self::REMOTE_ADDR_WILDCARD)
        .union(Self::LOCAL_ADDR_WILDCARD)
        .union(Self::REMOTE_PORT_WILDCARD)
        .union(Self::LOCAL_PORT_WILDCARD)
        .union(Self::REMOTE_INTERFACE_WILDCARD)
        .union(Self::LOCAL_INTERFACE_WILDCARD);

    /// Bits that identify a route within its table.
    pub(crate) const KEY_MASK: Self = Self::DIRECTION_MASK.union(Self::WILDCARD_MASK);

    /// Bits [`Context::route_update_flags`] may change.
    ///
    /// [`Context::route_update_flags`]: crate::Context::route_update_flags
    pub(crate) const MUTABLE_MASK: Self =
        Self::DISPOSITION_MASK.union(Self::TCPLIKE_PORT_NUMBERS);

    #[inline]
    pub fn wildcards(self) -> Self {
        self & Self::WILDCARD_MASK
    }

    #[inline]
    pub fn direction(self) -> Self {
        self & Self::DIRECTION_MASK
    }
}

/// Validates an endpoint pair + flags combination for insertion.
///
/// Every wildcard bit requires its field to be zero; a family wildcard
/// additionally requires both address wildcards, since an address without a
/// family has no width.
pub(crate) fn validate_insert(remote: &Endpoint, local: &Endpoint, flags: RouteFlags) -> Result<()> {
    if flags.contains(RouteFlags::DISPOSITION_MASK) {
        return Err(Error::InvalidArg);
    }

    if flags.contains(RouteFlags::FAMILY_WILDCARD) {
        if !remote.family.is_unspecified() || !local.family.is_unspecified() {
            return Err(Error::InvalidArg);
        }
        if !flags.contains(RouteFlags::REMOTE_ADDR_WILDCARD | RouteFlags::LOCAL_ADDR_WILDCARD) {
            return Err(Error::InvalidArg);
        }
    } else if remote.family.is_unspecified() || local.family.is_unspecified() {
        return Err(Error::InvalidArg);
    }

    if flags.contains(RouteFlags::PROTO_WILDCARD)
        && (!remote.proto.is_unspecified() || !local.proto.is_unspecified())
    {
        return Err(Error::InvalidArg);
    }

    for (ep, addr_wc, port_wc, iface_wc) in [
        (
            remote,
            RouteFlags::REMOTE_ADDR_WILDCARD,
            RouteFlags::REMOTE_PORT_WILDCARD,
            RouteFlags::REMOTE_INTERFACE_WILDCARD,
        ),
        (
            local,
            RouteFlags::LOCAL_ADDR_WILDCARD,
            RouteFlags::LOCAL_PORT_WILDCARD,
            RouteFlags::LOCAL_INTERFACE_WILDCARD,
        ),
    ] {
        if flags.contains(addr_wc) {
            if ep.addr_bits() != 0 {
                return Err(Error::InvalidArg);
            }
        } else if !flags.contains(RouteFlags::FAMILY_WILDCARD) && ep.addr_bits() == 0 {
            return Err(Error::InvalidArg);
        }
        if flags.contains(port_wc) && ep.port != 0 {
            return Err(Error::InvalidArg);
        }
        if flags.contains(iface_wc) && ep.interface != 0 {
            return Err(Error::InvalidArg);
        }
    }

    Ok(())
}

/// Per-route private-data blob with caller-configured size and alignment.
///
/// The engine zero-fills the blob at allocation and never touches it again;
/// interpretation and concurrent-access discipline belong to the host.
pub(crate) struct PrivateData {
    ptr: Option<NonNull<u8>>,
    layout: Layout,
    allocator: Arc<dyn BlobAllocator>,
}

// The blob is opaque to the engine; the pointer is only dereferenced by the
// host, which owns the access discipline.
unsafe impl Send for PrivateData {}
unsafe impl Sync for PrivateData {}

impl PrivateData {
    pub fn new(size: usize, alignment: usize, allocator: Arc<dyn BlobAllocator>) -> Result<Self> {
        let alignment = alignment.max(1);
        let layout = Layout::from_size_align(size, alignment).map_err(|_| Error::InvalidArg)?;
        let ptr = if size == 0 {
            None
        } else {
            Some(allocator.alloc(layout)?)
        };
        Ok(Self {
            ptr,
            layout,
            allocator,
        })
    }
}

impl Drop for PrivateData {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            unsafe { self.allocator.dealloc(ptr, self.layout) };
        }
    }
}

/// A policy entry owned by exactly one route table.
pub struct Route {
    id: Id,
    parent_event: Option<Label>,
    remote: Endpoint,
    local: Endpoint,
    flags: AtomicU32,
    private: PrivateData,
    hits: AtomicU64,
    last_hit_micros: AtomicU64,
    connections: AtomicU32,
    deleted: AtomicBool,
}

impl Route {
    pub(crate) fn new(
        id: Id,
        parent_event: Option<Label>,
        remote: Endpoint,
        local: Endpoint,
        flags: RouteFlags,
        private: PrivateData,
    ) -> Self {
        Self {
            id,
            parent_event,
            remote,
            local,
            flags: AtomicU32::new(flags.bits()),
            private,
            hits: AtomicU64::new(0),
            last_hit_micros: AtomicU64::new(0),
            connections: AtomicU32::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> RouteFlags {
        RouteFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: RouteFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    #[inline]
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    #[inline]
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    #[inline]
    pub fn parent_event(&self) -> Option<&str> {
        self.parent_event.as_ref().map(Label::as_str)
    }

    pub(crate) fn parent_event_label(&self) -> Option<&Label> {
        self.parent_event.as_ref()
    }

    /// Number of dispatches this route has satisfied.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Time of the most recent hit, if any.
    pub fn last_hit(&self) -> Option<Timestamp> {
        match self.last_hit_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Timestamp::from_micros(micros)),
        }
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self, now: Timestamp) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_hit_micros.store(now.as_micros(), Ordering::Relaxed);
    }

    pub(crate) fn connection_open(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_close(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// True once the route has been removed from its table; it stays alive
    /// while references are outstanding but is no longer matchable.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Base pointer of the private-data blob, or `None` when the context
    /// was configured without one. Valid while the caller holds a
    /// [`RouteRef`].
    pub fn private_data_ptr(&self) -> Option<NonNull<u8>> {
        self.private.ptr
    }

    pub fn private_data_len(&self) -> usize {
        self.private.layout.size()
    }

    pub(crate) fn key(&self) -> table::RouteKey {
        table::RouteKey::new(self.flags(), self.remote, self.local)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("flags", &self.flags())
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("parent_event", &self.parent_event)
            .finish_non_exhaustive()
    }
}

/// A counted reference to a route.
///
/// References keep the route alive past table removal; dropping the last
/// one deallocates a deleted route. Use [`release`](Self::release) instead
/// of a plain drop when the caller needs to learn whether that happened.
#[derive(Clone, Debug)]
pub struct RouteRef(pub(crate) Arc<Route>);

impl RouteRef {
    /// Drops the reference, reporting `DEALLOCATED` when it was the last
    /// one and the route's storage was freed.
    pub fn release(self) -> crate::action::ActionResults {
        let mut results = crate::action::ActionResults::NONE;
        if Arc::strong_count(&self.0) == 1 {
            results |= crate::action::ActionResults::DEALLOCATED;
        }
        results
    }
}

impl core::ops::Deref for RouteRef {
    type Target = Route;

    fn deref(&self) -> &Route {
        &self.0
    }
}
