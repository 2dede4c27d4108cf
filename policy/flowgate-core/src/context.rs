// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The engine's top-level container.
//!
//! A [`Context`] owns the route table, the event and action registries, and
//! the id allocator, all behind one reader–writer lock: reads and dispatch
//! take it shared, mutations take it exclusive. Contexts are meant to be
//! shared across threads behind an `Arc`.
//!
//! For configuration reload, [`Context::clone_as_at_creation`] produces an
//! empty context with the same configuration and action/event definitions;
//! a loader fills it and [`Context::exchange`] swaps it with the live one
//! atomically.

use crate::{
    action::{ActionFlags, ActionHandler, ActionResults, ActionType},
    dispatch,
    error::{Error, Result},
    event::{Event, EventFlags, EventTable},
    hpi::Hpi,
    id::{Id, IdAllocator},
    inet::Endpoint,
    label::Label,
    route::{
        self,
        table::{RouteKey, RouteTable},
        PrivateData, Route, RouteCursor, RouteFlags, RouteRef,
    },
    sync::Rwlock,
};
use core::{any::Any, cell::UnsafeCell, fmt};
use std::sync::Arc;
use tracing::{debug, trace};

/// Context-wide defaults, also usable as a per-event override.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Size in bytes of the private-data blob carried by every route.
    pub route_private_data_size: usize,
    /// Alignment of the blob; zero means natural, otherwise a power of two
    /// no larger than the size.
    pub route_private_data_alignment: usize,
    /// Upper bound enforced on `CONNECT`-tracking routes; zero disables.
    pub max_connection_count: u32,
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        let alignment = self.route_private_data_alignment;
        if alignment != 0
            && (!alignment.is_power_of_two() || alignment > self.route_private_data_size.max(1))
        {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }
}

/// Identity of the route (if any) a dispatch used, and how loosely it
/// matched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// The matched route, or `None` when only the default policy applied.
    pub route_id: Option<Id>,
    /// The wildcard bits the match relied on.
    pub inexact_matches: RouteFlags,
}

pub(crate) struct Tables {
    pub routes: RouteTable,
    pub events: EventTable,
    pub actions: crate::action::ActionTable,
    pub ids: IdAllocator,
}

impl Tables {
    fn new() -> Self {
        Self {
            routes: RouteTable::new(),
            events: EventTable::new(),
            actions: crate::action::ActionTable::new(),
            ids: IdAllocator::new(),
        }
    }
}

pub struct Context {
    hpi: Hpi,
    config: Config,
    lock: Rwlock,
    tables: UnsafeCell<Tables>,
}

// All access to `tables` happens under `lock`; see `read`/`write`.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

struct UnlockOnDrop<'a>(&'a Rwlock);

impl Drop for UnlockOnDrop<'_> {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

impl Context {
    /// Creates a context. `None` for `hpi` means platform defaults.
    pub fn new(hpi: Option<Hpi>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hpi: hpi.unwrap_or_default(),
            config,
            lock: Rwlock::new(),
            tables: UnsafeCell::new(Tables::new()),
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The context's lock. Exposed so embedders can compose their own
    /// read-modify sequences with the reservation protocol.
    #[inline]
    pub fn lock(&self) -> &Rwlock {
        &self.lock
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Tables) -> Result<R>) -> Result<R> {
        self.lock.shared()?;
        let _unlock = UnlockOnDrop(&self.lock);
        // Safety: shared lock held; mutation only happens under exclusive
        f(unsafe { &*self.tables.get() })
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        self.lock.mutex()?;
        let _unlock = UnlockOnDrop(&self.lock);
        // Safety: exclusive lock held
        f(unsafe { &mut *self.tables.get() })
    }

    pub(crate) fn clock_now(&self) -> crate::time::Timestamp {
        self.hpi.clock.get_time()
    }

    // --- routes ---------------------------------------------------------

    /// Inserts a route, returning its id and the outcome of the parent
    /// event's on-insert chain.
    pub fn route_insert(
        &self,
        remote: &Endpoint,
        local: &Endpoint,
        flags: RouteFlags,
        parent_event: Option<&str>,
        caller_arg: Option<&dyn Any>,
    ) -> Result<(Id, ActionResults)> {
        let parent = parent_event.map(Label::new).transpose()?;
        route::validate_insert(remote, local, flags)?;
        self.write(|tables| {
            let event_config = match &parent {
                Some(label) => tables.events.get(label.as_str())?.config().copied(),
                None => None,
            };
            let blob_config = event_config.unwrap_or(self.config);
            let private = PrivateData::new(
                blob_config.route_private_data_size,
                blob_config.route_private_data_alignment,
                self.hpi.allocator.clone(),
            )?;

            let id = tables.ids.next();
            let route = Arc::new(Route::new(
                id,
                parent.clone(),
                *remote,
                *local,
                flags,
                private,
            ));
            tables.routes.insert(route.clone())?;
            debug!(id, ?flags, "route inserted");

            let mut results = ActionResults::NONE;
            let route_ref = RouteRef(route.clone());
            let chain = dispatch::run_event_chains(
                self,
                tables,
                &route_ref,
                parent.as_ref(),
                None,
                ActionType::Insert,
                caller_arg,
                &mut results,
            );
            if let Err(err) = chain {
                tables.routes.remove_by_id(id);
                return Err(err);
            }
            if results.contains(ActionResults::REJECT) {
                // the on-insert chain vetoed the route
                tables.routes.remove_by_id(id);
                results.insert(ActionResults::INSERT_WAS_DELETED);
                debug!(id, "route insert vetoed by chain");
            }
            Ok((id, results))
        })
    }

    /// Deletes the route whose key (direction and wildcard flags plus
    /// endpoint pair) matches exactly. Returns how many entries were
    /// removed and the outcome bits, including `DEALLOCATED` when the last
    /// reference went away.
    pub fn route_delete(
        &self,
        remote: &Endpoint,
        local: &Endpoint,
        flags: RouteFlags,
        trigger_event: Option<&str>,
        caller_arg: Option<&dyn Any>,
    ) -> Result<(usize, ActionResults)> {
        let trigger = trigger_event.map(Label::new).transpose()?;
        self.write(|tables| {
            let key = RouteKey::new(flags, *remote, *local);
            let route = tables
                .routes
                .remove_by_key(&key)
                .ok_or(Error::ItemNotFound)?;
            self.finish_route_removal(tables, route, trigger.as_ref(), caller_arg)
                .map(|results| (1, results))
        })
    }

    /// Deletes a single route by id.
    pub fn route_delete_by_id(
        &self,
        id: Id,
        trigger_event: Option<&str>,
        caller_arg: Option<&dyn Any>,
    ) -> Result<ActionResults> {
        let trigger = trigger_event.map(Label::new).transpose()?;
        self.write(|tables| {
            let route = tables.routes.remove_by_id(id).ok_or(Error::ItemNotFound)?;
            self.finish_route_removal(tables, route, trigger.as_ref(), caller_arg)
        })
    }

    fn finish_route_removal(
        &self,
        tables: &mut Tables,
        route: Arc<Route>,
        trigger: Option<&Label>,
        caller_arg: Option<&dyn Any>,
    ) -> Result<ActionResults> {
        let mut results = ActionResults::NONE;
        let route_ref = RouteRef(route.clone());
        dispatch::run_event_chains(
            self,
            tables,
            &route_ref,
            route.parent_event_label(),
            trigger,
            ActionType::Delete,
            caller_arg,
            &mut results,
        )?;
        debug!(id = route.id(), "route deleted");
        drop(route_ref);
        if Arc::strong_count(&route) == 1 {
            results.insert(ActionResults::DEALLOCATED);
        }
        Ok(results)
    }

    /// Looks up a route by exact key and hands out a counted reference.
    /// The reference keeps the route alive past deletion; drop it with
    /// [`RouteRef::release`] to learn whether that freed the route.
    pub fn route_get_reference(
        &self,
        remote: &Endpoint,
        local: &Endpoint,
        flags: RouteFlags,
    ) -> Result<RouteRef> {
        self.read(|tables| {
            let key = RouteKey::new(flags, *remote, *local);
            tables
                .routes
                .get_exact(&key)
                .map(|route| RouteRef(route.clone()))
                .ok_or(Error::ItemNotFound)
        })
    }

    pub fn route_get_reference_by_id(&self, id: Id) -> Result<RouteRef> {
        self.read(|tables| {
            tables
                .routes
                .get_by_id(id)
                .map(|route| RouteRef(route.clone()))
                .ok_or(Error::ItemNotFound)
        })
    }

    /// Updates a route's mutable flag bits (disposition and
    /// `TCPLIKE_PORT_NUMBERS`), returning before and after snapshots.
    /// `UPDATE_WAS_A_NOOP` is reported when nothing changed.
    pub fn route_update_flags(
        &self,
        id: Id,
        set: RouteFlags,
        clear: RouteFlags,
    ) -> Result<(RouteFlags, RouteFlags, ActionResults)> {
        if (set | clear).intersects(RouteFlags::from_bits(
            !RouteFlags::MUTABLE_MASK.bits(),
        )) {
            return Err(Error::InvalidArg);
        }
        self.write(|tables| {
            let route = tables.routes.get_by_id(id).ok_or(Error::ItemNotFound)?.clone();
            let before = route.flags();
            let mut after = before;
            after.remove(clear);
            after.insert(set);
            if after.contains(RouteFlags::DISPOSITION_MASK) {
                return Err(Error::InvalidArg);
            }
            route.set_flags(after);

            let mut results = ActionResults::NONE;
            if after == before {
                results.insert(ActionResults::UPDATE_WAS_A_NOOP);
            }
            let route_ref = RouteRef(route.clone());
            dispatch::run_event_chains(
                self,
                tables,
                &route_ref,
                route.parent_event_label(),
                None,
                ActionType::Update,
                None,
                &mut results,
            )?;
            Ok((before, after, results))
        })
    }

    pub fn route_count(&self) -> Result<usize> {
        self.read(|tables| Ok(tables.routes.n_ents()))
    }

    /// Opens a cursor over the routes present right now. The cursor stays
    /// valid across mutation; routes inserted afterwards are not observed.
    pub fn route_cursor(&self) -> Result<RouteCursor> {
        self.read(|tables| Ok(RouteCursor::new(tables.routes.snapshot())))
    }

    /// Policy applied when dispatch finds no matching route. Only `ACCEPT`
    /// and `REJECT` bits are meaningful here.
    pub fn default_policy_set(&self, policy: ActionResults) -> Result<()> {
        if policy.intersects(ActionResults::from_bits(
            !(ActionResults::ACCEPT | ActionResults::REJECT).bits(),
        )) {
            return Err(Error::InvalidArg);
        }
        self.write(|tables| {
            tables.routes.set_default_policy(policy);
            Ok(())
        })
    }

    pub fn default_policy(&self) -> Result<ActionResults> {
        self.read(|tables| Ok(tables.routes.default_policy()))
    }

    // --- dispatch -------------------------------------------------------

    /// Decides the fate of a flow.
    ///
    /// Selects the most specific route matching the endpoint pair and
    /// direction, pins `ACCEPT`/`REJECT` from the route's disposition, runs
    /// the on-match chains of the route's parent event and the caller's
    /// trigger event in priority order, applies connection-count limits,
    /// then runs the on-decision chains.
    ///
    /// `results` is cleared on entry and aggregated across the chain; when
    /// a callback errors the partial bits are retained and the error
    /// propagates. With no matching route and no default policy the call
    /// still succeeds, with neither `ACCEPT` nor `REJECT` pinned.
    pub fn dispatch(
        &self,
        remote: &Endpoint,
        local: &Endpoint,
        flags: RouteFlags,
        trigger_event: Option<&str>,
        caller_arg: Option<&dyn Any>,
        results: &mut ActionResults,
    ) -> Result<Dispatch> {
        *results = ActionResults::NONE;
        if flags.direction().is_empty() {
            return Err(Error::InvalidArg);
        }
        let trigger = trigger_event.map(Label::new).transpose()?;
        self.read(|tables| {
            if let Some(label) = &trigger {
                // a named trigger must exist
                tables.events.get(label.as_str())?;
            }

            let Some((route, inexact)) = tables.routes.best_match(remote, local, flags) else {
                *results |= tables.routes.default_policy();
                trace!(?flags, "dispatch matched no route");
                return Ok(Dispatch {
                    route_id: None,
                    inexact_matches: RouteFlags::NONE,
                });
            };

            route.record_hit(self.clock_now());
            let route_flags = route.flags();
            if route_flags.contains(RouteFlags::PENALTYBOXED) {
                results.insert(ActionResults::REJECT);
            } else if route_flags.contains(RouteFlags::GREENLISTED) {
                results.insert(ActionResults::ACCEPT);
            }

            let route_ref = RouteRef(route.clone());
            dispatch::run_event_chains(
                self,
                tables,
                &route_ref,
                route.parent_event_label(),
                trigger.as_ref(),
                ActionType::Match,
                caller_arg,
                results,
            )?;

            self.apply_connection_limits(tables, &route, results);

            dispatch::run_event_chains(
                self,
                tables,
                &route_ref,
                route.parent_event_label(),
                trigger.as_ref(),
                ActionType::Decision,
                caller_arg,
                results,
            )?;

            trace!(route_id = route.id(), ?inexact, "dispatch matched");
            Ok(Dispatch {
                route_id: Some(route.id()),
                inexact_matches: inexact,
            })
        })
    }

    fn apply_connection_limits(
        &self,
        tables: &Tables,
        route: &Arc<Route>,
        results: &mut ActionResults,
    ) {
        let effective = route
            .parent_event_label()
            .and_then(|label| tables.events.get(label.as_str()).ok())
            .and_then(|event| event.config().copied())
            .unwrap_or(self.config);
        if results.contains(ActionResults::CONNECT) && effective.max_connection_count > 0 {
            if route.connection_count() >= effective.max_connection_count {
                results.remove(ActionResults::CONNECT);
                results.insert(ActionResults::REJECT);
            } else {
                route.connection_open();
            }
        }
        if results.contains(ActionResults::DISCONNECT) {
            route.connection_close();
        }
    }

    // --- events ---------------------------------------------------------

    pub fn event_insert(
        &self,
        label: &str,
        priority: u8,
        config: Option<Config>,
        flags: EventFlags,
    ) -> Result<Id> {
        let label = Label::new(label)?;
        if let Some(config) = &config {
            config.validate()?;
        }
        self.write(|tables| {
            let id = tables.ids.next();
            tables
                .events
                .insert(Event::new(id, label.clone(), priority, config, flags))?;
            debug!(%label, id, "event inserted");
            Ok(id)
        })
    }

    /// Removes an event and releases its chains' action references.
    pub fn event_delete(&self, label: &str) -> Result<()> {
        let label = Label::new(label)?;
        self.write(|tables| {
            let event = tables.events.remove(label.as_str())?;
            for action in event.all_chain_actions() {
                tables.actions.drop_chain_ref(action.as_str());
            }
            debug!(%label, id = event.id(), "event deleted");
            Ok(())
        })
    }

    pub fn event_priority(&self, label: &str) -> Result<u8> {
        let label = Label::new(label)?;
        self.read(|tables| Ok(tables.events.get(label.as_str())?.priority()))
    }

    pub fn event_action_append(
        &self,
        event: &str,
        action_type: ActionType,
        action: &str,
    ) -> Result<()> {
        self.event_action_add(event, action_type, action, false)
    }

    pub fn event_action_prepend(
        &self,
        event: &str,
        action_type: ActionType,
        action: &str,
    ) -> Result<()> {
        self.event_action_add(event, action_type, action, true)
    }

    fn event_action_add(
        &self,
        event: &str,
        action_type: ActionType,
        action: &str,
        prepend: bool,
    ) -> Result<()> {
        let event = Label::new(event)?;
        let action = Label::new(action)?;
        self.write(|tables| {
            if !tables.events.contains(event.as_str()) {
                return Err(Error::ItemNotFound);
            }
            tables.actions.add_chain_ref(action.as_str())?;
            let entry = tables.events.get_mut(event.as_str())?;
            if prepend {
                entry.chain_prepend(action_type, action.clone());
            } else {
                entry.chain_append(action_type, action.clone());
            }
            Ok(())
        })
    }

    /// Removes the first occurrence of `action` from an event's chain.
    pub fn event_action_delete(
        &self,
        event: &str,
        action_type: ActionType,
        action: &str,
    ) -> Result<()> {
        let event = Label::new(event)?;
        let action = Label::new(action)?;
        self.write(|tables| {
            tables
                .events
                .get_mut(event.as_str())?
                .chain_delete(action_type, action.as_str())?;
            tables.actions.drop_chain_ref(action.as_str());
            Ok(())
        })
    }

    /// The labels of an event's chain for one action type, in run order.
    pub fn event_action_list(&self, event: &str, action_type: ActionType) -> Result<Vec<String>> {
        let event = Label::new(event)?;
        self.read(|tables| {
            Ok(tables
                .events
                .get(event.as_str())?
                .chain(action_type)
                .iter()
                .map(|label| label.as_str().to_owned())
                .collect())
        })
    }

    // --- actions --------------------------------------------------------

    pub fn action_insert(
        &self,
        label: &str,
        flags: ActionFlags,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<Id> {
        let label = Label::new(label)?;
        self.write(|tables| {
            let id = tables.ids.next();
            tables.actions.insert(id, label.clone(), flags, handler)?;
            debug!(%label, id, "action inserted");
            Ok(id)
        })
    }

    /// Removes an action; `Busy` while any event chain references it.
    pub fn action_delete(&self, label: &str) -> Result<()> {
        let label = Label::new(label)?;
        self.write(|tables| tables.actions.remove(label.as_str()))
    }

    pub fn action_get_flags(&self, label: &str) -> Result<ActionFlags> {
        let label = Label::new(label)?;
        self.read(|tables| Ok(tables.actions.get(label.as_str())?.flags()))
    }

    /// Atomically applies clear-then-set, returning (before, after).
    pub fn action_update_flags(
        &self,
        label: &str,
        set: ActionFlags,
        clear: ActionFlags,
    ) -> Result<(ActionFlags, ActionFlags)> {
        let label = Label::new(label)?;
        self.write(|tables| {
            let entry = tables.actions.get_mut(label.as_str())?;
            let before = entry.flags();
            let mut after = before;
            after.remove(clear);
            after.insert(set);
            entry.set_flags(after);
            Ok((before, after))
        })
    }

    // --- lifecycle ------------------------------------------------------

    /// Produces an empty context with this one's configuration and
    /// action/event definitions, as they stand now. Routes, hit counters,
    /// and the default policy start fresh.
    pub fn clone_as_at_creation(&self) -> Result<Context> {
        self.read(|tables| {
            debug!("context cloned");
            Ok(Context {
                hpi: self.hpi.clone(),
                config: self.config,
                lock: Rwlock::new(),
                tables: UnsafeCell::new(Tables {
                    routes: RouteTable::new(),
                    events: tables.events.clone(),
                    actions: tables.actions.clone(),
                    ids: IdAllocator::from_value(tables.ids.peek()),
                }),
            })
        })
    }

    /// Atomically swaps the internal tables of two contexts. Both must
    /// share one configuration. Used by load-then-commit reloads.
    pub fn exchange(a: &Context, b: &Context) -> Result<()> {
        if core::ptr::eq(a, b) {
            return Err(Error::InvalidArg);
        }
        if a.config != b.config {
            return Err(Error::IncompatibleState);
        }
        // lock in address order so concurrent exchanges cannot deadlock
        let (first, second) = if (a as *const Context) < (b as *const Context) {
            (a, b)
        } else {
            (b, a)
        };
        first.lock.mutex()?;
        let _unlock_first = UnlockOnDrop(&first.lock);
        second.lock.mutex()?;
        let _unlock_second = UnlockOnDrop(&second.lock);
        // Safety: both exclusive locks held, and the contexts are distinct
        unsafe { core::ptr::swap(a.tables.get(), b.tables.get()) };
        debug!("contexts exchanged");
        Ok(())
    }

    /// Tears the context down, refusing while route references are
    /// outstanding. On refusal the context is handed back untouched.
    pub fn shutdown(self) -> core::result::Result<(), (Self, Error)> {
        let outstanding = match self.read(|tables| Ok(tables.routes.any_external_refs())) {
            Ok(outstanding) => outstanding,
            Err(err) => return Err((self, err)),
        };
        if outstanding {
            return Err((self, Error::Busy));
        }
        debug!("context shut down");
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
