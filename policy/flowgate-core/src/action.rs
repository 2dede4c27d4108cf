// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Labelled callbacks and the result bits they report.
//!
//! Actions are host-supplied side effects hung off events. A chain entry
//! refers to its action by label, and the registry refuses to delete an
//! action while any chain still references it.

use crate::{
    error::{Error, Result},
    id::Id,
    label::Label,
    macros::bitset,
    route::RouteRef,
};
use core::{any::Any, fmt};
use std::sync::Arc;

bitset!(
    /// Action attribute bits.
    pub struct ActionFlags(u32);

    /// The action stays registered but is skipped by chain execution.
    const DISABLED = 1 << 0;
);

bitset!(
    /// Aggregated outcome of an engine operation.
    ///
    /// This is a bitset, not a sum type: several callbacks may set
    /// overlapping bits, and `ACCEPT` and `REJECT` are tested
    /// independently by callers. A rule that sets both is defined behavior,
    /// if undesirable.
    pub struct ActionResults(u32);

    /// The flow is allowed.
    const ACCEPT = 1 << 0;
    /// The flow is refused.
    const REJECT = 1 << 1;
    /// The dispatch opens a tracked connection, subject to
    /// `max_connection_count`.
    const CONNECT = 1 << 2;
    /// The dispatch closes a tracked connection.
    const DISCONNECT = 1 << 3;
    /// Terminate the action chain cleanly after this action.
    const STOP = 1 << 4;
    /// The operation freed the last reference to a route.
    const DEALLOCATED = 1 << 5;
    /// An insert was immediately undone by its on-insert chain.
    const INSERT_WAS_DELETED = 1 << 6;
    /// A flags update changed nothing.
    const UPDATE_WAS_A_NOOP = 1 << 7;
);

/// Lifecycle point a chain entry runs at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionType {
    Insert,
    Match,
    Update,
    Delete,
    Decision,
}

impl ActionType {
    pub(crate) const COUNT: usize = 5;

    pub const ALL: [ActionType; Self::COUNT] = [
        ActionType::Insert,
        ActionType::Match,
        ActionType::Update,
        ActionType::Delete,
        ActionType::Decision,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            ActionType::Insert => 0,
            ActionType::Match => 1,
            ActionType::Update => 2,
            ActionType::Delete => 3,
            ActionType::Decision => 4,
        }
    }
}

/// Everything an action callback may look at.
///
/// Callbacks run with the context lock held shared (exclusive for insert,
/// update, and delete chains). They may call read-only context accessors;
/// calling back into mutating operations fails or deadlocks by design.
pub struct ActionContext<'a> {
    pub context: &'a crate::context::Context,
    /// Label of the action being invoked.
    pub action: &'a str,
    pub action_flags: ActionFlags,
    /// Parent event of the matched route, when it has one.
    pub parent_event: Option<&'a str>,
    /// Event named by the dispatch caller, when there is one.
    pub trigger_event: Option<&'a str>,
    pub action_type: ActionType,
    /// The route the operation concerns. Borrowed; take a clone to extend
    /// its lifetime past the callback.
    pub route: &'a RouteRef,
    /// Opaque per-call argument from the dispatch caller.
    pub caller_arg: Option<&'a dyn Any>,
}

impl fmt::Debug for ActionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("action", &self.action)
            .field("parent_event", &self.parent_event)
            .field("trigger_event", &self.trigger_event)
            .field("action_type", &self.action_type)
            .field("route", &self.route.id())
            .finish_non_exhaustive()
    }
}

/// A registered callback.
///
/// An `Err` return aborts the rest of the chain for that operation and
/// propagates to the caller; bits already set in `results` are retained.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, args: &ActionContext<'_>, results: &mut ActionResults) -> Result<()>;
}

impl<F> ActionHandler for F
where
    F: Fn(&ActionContext<'_>, &mut ActionResults) -> Result<()> + Send + Sync,
{
    fn handle(&self, args: &ActionContext<'_>, results: &mut ActionResults) -> Result<()> {
        self(args, results)
    }
}

/// Handler that does nothing. Registered for actions declared from
/// configuration data before code installs the real callback.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAction;

impl ActionHandler for NoopAction {
    fn handle(&self, _args: &ActionContext<'_>, _results: &mut ActionResults) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct ActionEnt {
    id: Id,
    flags: ActionFlags,
    handler: Arc<dyn ActionHandler>,
    /// Number of event-chain entries referring to this action.
    chain_refs: usize,
}

impl ActionEnt {
    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> ActionFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: ActionFlags) {
        self.flags = flags;
    }

    #[inline]
    pub fn handler(&self) -> &Arc<dyn ActionHandler> {
        &self.handler
    }
}

impl fmt::Debug for ActionEnt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ActionEnt")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("chain_refs", &self.chain_refs)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ActionTable {
    ents: hashbrown::HashMap<Label, ActionEnt>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self {
            ents: hashbrown::HashMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        id: Id,
        label: Label,
        flags: ActionFlags,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<()> {
        match self.ents.entry(label) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(Error::ItemAlreadyPresent),
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(ActionEnt {
                    id,
                    flags,
                    handler,
                    chain_refs: 0,
                });
                Ok(())
            }
        }
    }

    /// Removes an action; `Busy` while event chains still reference it.
    pub fn remove(&mut self, label: &str) -> Result<()> {
        let ent = self.ents.get(label).ok_or(Error::ItemNotFound)?;
        if ent.chain_refs > 0 {
            return Err(Error::Busy);
        }
        self.ents.remove(label);
        Ok(())
    }

    pub fn get(&self, label: &str) -> Result<&ActionEnt> {
        self.ents.get(label).ok_or(Error::ItemNotFound)
    }

    pub fn get_mut(&mut self, label: &str) -> Result<&mut ActionEnt> {
        self.ents.get_mut(label).ok_or(Error::ItemNotFound)
    }

    pub fn add_chain_ref(&mut self, label: &str) -> Result<()> {
        self.get_mut(label)?.chain_refs += 1;
        Ok(())
    }

    pub fn drop_chain_ref(&mut self, label: &str) {
        if let Some(ent) = self.ents.get_mut(label) {
            ent.chain_refs = ent.chain_refs.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn ActionHandler> {
        Arc::new(NoopAction)
    }

    #[test]
    fn registry_semantics() {
        let mut table = ActionTable::new();
        let label = Label::new("track").unwrap();
        table.insert(1, label.clone(), ActionFlags::NONE, noop()).unwrap();
        assert_eq!(
            table.insert(2, label, ActionFlags::NONE, noop()),
            Err(Error::ItemAlreadyPresent)
        );
        assert_eq!(table.get("nope").err(), Some(Error::ItemNotFound));
        assert_eq!(table.get("track").unwrap().id(), 1);
    }

    #[test]
    fn chain_refs_block_removal() {
        let mut table = ActionTable::new();
        table
            .insert(1, Label::new("track").unwrap(), ActionFlags::NONE, noop())
            .unwrap();
        table.add_chain_ref("track").unwrap();
        assert_eq!(table.remove("track"), Err(Error::Busy));
        table.drop_chain_ref("track");
        table.remove("track").unwrap();
        assert_eq!(table.remove("track"), Err(Error::ItemNotFound));
    }

    #[test]
    fn closure_handlers_work() {
        let handler = |_args: &ActionContext<'_>, results: &mut ActionResults| {
            results.insert(ActionResults::ACCEPT);
            Ok(())
        };
        // only checks the blanket impl applies
        let _boxed: Arc<dyn ActionHandler> = Arc::new(handler);
    }
}
