// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Route container and most-specific-first matching.
//!
//! The table is an ordered map keyed on (direction + wildcard flags,
//! endpoint pair); lookup is a scoring scan over all entries. Preference
//! order, highest first:
//!
//! 1. fewer wildcard bits;
//! 2. longer remote-address prefix, then longer local-address prefix;
//! 3. exact interface, exact protocol, exact ports (exacts beat wildcards);
//! 4. a route carrying exactly the requested direction beats one carrying
//!    both;
//!
//! with remaining ties broken by insertion id, ascending.

use crate::{
    action::ActionResults,
    error::{Error, Result},
    id::Id,
    inet::Endpoint,
    route::{Route, RouteFlags, RouteRef},
};
use hashbrown::HashMap;
use std::{collections::BTreeMap, sync::Arc};

/// Identity of a route within its table: the flags that participate in
/// matching plus the normalized endpoint pair.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct RouteKey {
    flags: u32,
    remote: Endpoint,
    local: Endpoint,
}

impl RouteKey {
    pub fn new(flags: RouteFlags, remote: Endpoint, local: Endpoint) -> Self {
        Self {
            flags: (flags & RouteFlags::KEY_MASK).bits(),
            remote,
            local,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RouteTable {
    ents: BTreeMap<RouteKey, Arc<Route>>,
    by_id: HashMap<Id, RouteKey>,
    default_policy: ActionResults,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            ents: BTreeMap::new(),
            by_id: HashMap::new(),
            default_policy: ActionResults::NONE,
        }
    }

    pub fn n_ents(&self) -> usize {
        self.ents.len()
    }

    pub fn default_policy(&self) -> ActionResults {
        self.default_policy
    }

    pub fn set_default_policy(&mut self, policy: ActionResults) {
        self.default_policy = policy;
    }

    pub fn insert(&mut self, route: Arc<Route>) -> Result<()> {
        let key = route.key();
        if self.ents.contains_key(&key) {
            return Err(Error::ItemAlreadyPresent);
        }
        self.by_id.insert(route.id(), key.clone());
        self.ents.insert(key, route);
        Ok(())
    }

    /// Removes the route with exactly this key, marking it deleted.
    pub fn remove_by_key(&mut self, key: &RouteKey) -> Option<Arc<Route>> {
        let route = self.ents.remove(key)?;
        self.by_id.remove(&route.id());
        route.mark_deleted();
        Some(route)
    }

    pub fn remove_by_id(&mut self, id: Id) -> Option<Arc<Route>> {
        let key = self.by_id.remove(&id)?;
        let route = self.ents.remove(&key)?;
        route.mark_deleted();
        Some(route)
    }

    pub fn get_exact(&self, key: &RouteKey) -> Option<&Arc<Route>> {
        self.ents.get(key)
    }

    pub fn get_by_id(&self, id: Id) -> Option<&Arc<Route>> {
        self.ents.get(self.by_id.get(&id)?)
    }

    /// True when any route is referenced outside the table.
    pub fn any_external_refs(&self) -> bool {
        self.ents.values().any(|route| Arc::strong_count(route) > 1)
    }

    /// Most specific route matching the query, with the wildcard bits the
    /// match relied on.
    pub fn best_match(
        &self,
        remote: &Endpoint,
        local: &Endpoint,
        query_flags: RouteFlags,
    ) -> Option<(Arc<Route>, RouteFlags)> {
        let mut best: Option<(Score, Arc<Route>, RouteFlags)> = None;
        for route in self.ents.values() {
            let Some((score, inexact)) = match_route(route, remote, local, query_flags) else {
                continue;
            };
            let better = match &best {
                Some((incumbent, _, _)) => score.beats(incumbent),
                None => true,
            };
            if better {
                best = Some((score, route.clone(), inexact));
            }
        }
        best.map(|(_, route, inexact)| (route, inexact))
    }

    /// Stable snapshot of the table for cursor iteration.
    pub fn snapshot(&self) -> Vec<Arc<Route>> {
        self.ents.values().cloned().collect()
    }
}

/// Tests one route against a query; `None` when it does not match,
/// otherwise the specificity score and the inexact-match bits.
fn match_route(
    route: &Route,
    remote: &Endpoint,
    local: &Endpoint,
    query_flags: RouteFlags,
) -> Option<(Score, RouteFlags)> {
    let flags = route.flags();

    let query_direction = query_flags.direction();
    if !flags.direction().contains(query_direction) {
        return None;
    }

    let mut inexact = RouteFlags::NONE;

    if flags.contains(RouteFlags::FAMILY_WILDCARD) {
        inexact |= RouteFlags::FAMILY_WILDCARD;
    } else if route.remote().family != remote.family || route.local().family != local.family {
        return None;
    }

    if flags.contains(RouteFlags::PROTO_WILDCARD) {
        inexact |= RouteFlags::PROTO_WILDCARD;
    } else if route.remote().proto != remote.proto || route.local().proto != local.proto {
        return None;
    }

    let mut remote_prefix = 0;
    let mut local_prefix = 0;
    for (pattern, query, prefix_len, addr_wc, port_wc, iface_wc) in [
        (
            route.remote(),
            remote,
            &mut remote_prefix,
            RouteFlags::REMOTE_ADDR_WILDCARD,
            RouteFlags::REMOTE_PORT_WILDCARD,
            RouteFlags::REMOTE_INTERFACE_WILDCARD,
        ),
        (
            route.local(),
            local,
            &mut local_prefix,
            RouteFlags::LOCAL_ADDR_WILDCARD,
            RouteFlags::LOCAL_PORT_WILDCARD,
            RouteFlags::LOCAL_INTERFACE_WILDCARD,
        ),
    ] {
        if flags.contains(addr_wc) {
            inexact |= addr_wc;
        } else {
            if !pattern.covers_addr(query) {
                return None;
            }
            *prefix_len = pattern.addr_bits();
            if pattern.addr_bits() < query.addr_bits() {
                // matched on a shorter prefix than the query carries
                inexact |= addr_wc;
            }
        }

        if flags.contains(port_wc) {
            inexact |= port_wc;
        } else if pattern.port != query.port {
            return None;
        }

        if flags.contains(iface_wc) {
            inexact |= iface_wc;
        } else if pattern.interface != query.interface {
            return None;
        }
    }

    let score = Score {
        wildcards: flags.wildcards().count(),
        remote_prefix,
        local_prefix,
        exact_remote_iface: !flags.contains(RouteFlags::REMOTE_INTERFACE_WILDCARD),
        exact_local_iface: !flags.contains(RouteFlags::LOCAL_INTERFACE_WILDCARD),
        exact_proto: !flags.contains(RouteFlags::PROTO_WILDCARD),
        exact_remote_port: !flags.contains(RouteFlags::REMOTE_PORT_WILDCARD),
        exact_local_port: !flags.contains(RouteFlags::LOCAL_PORT_WILDCARD),
        direction_exact: flags.direction() == query_direction,
        id: route.id(),
    };
    Some((score, inexact))
}

/// Specificity of one candidate match.
#[derive(Debug, Clone, Copy)]
struct Score {
    wildcards: u32,
    remote_prefix: u8,
    local_prefix: u8,
    exact_remote_iface: bool,
    exact_local_iface: bool,
    exact_proto: bool,
    exact_remote_port: bool,
    exact_local_port: bool,
    direction_exact: bool,
    id: Id,
}

impl Score {
    fn beats(&self, other: &Score) -> bool {
        self.rank() > other.rank()
    }

    #[allow(clippy::type_complexity)]
    fn rank(
        &self,
    ) -> (
        core::cmp::Reverse<u32>,
        u8,
        u8,
        bool,
        bool,
        bool,
        bool,
        bool,
        bool,
        core::cmp::Reverse<Id>,
    ) {
        (
            core::cmp::Reverse(self.wildcards),
            self.remote_prefix,
            self.local_prefix,
            self.exact_remote_iface,
            self.exact_local_iface,
            self.exact_proto,
            self.exact_remote_port,
            self.exact_local_port,
            self.direction_exact,
            core::cmp::Reverse(self.id),
        )
    }
}

/// Cursor over the routes present when it was opened.
///
/// Mutation during iteration is permitted; routes inserted after the cursor
/// opened are not observed.
#[derive(Debug)]
pub struct RouteCursor {
    routes: std::vec::IntoIter<Arc<Route>>,
}

impl RouteCursor {
    pub(crate) fn new(routes: Vec<Arc<Route>>) -> Self {
        Self {
            routes: routes.into_iter(),
        }
    }
}

impl Iterator for RouteCursor {
    type Item = RouteRef;

    fn next(&mut self) -> Option<RouteRef> {
        self.routes.next().map(RouteRef)
    }
}
