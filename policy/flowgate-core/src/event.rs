// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Labelled events and their per-lifecycle action chains.
//!
//! Events form a flat namespace keyed by label. Each event carries a
//! priority (lower runs earlier when several events chain on one dispatch)
//! and five ordered action chains, one per [`ActionType`]. Routes name
//! their parent event by label; dispatch names a trigger event the same
//! way.

use crate::{
    action::ActionType,
    context::Config,
    error::{Error, Result},
    id::Id,
    label::Label,
    macros::bitset,
};
use hashbrown::HashMap;
use smallvec::SmallVec;

bitset!(
    /// Event attribute bits. None are currently defined; the type exists so
    /// the insert signature is stable.
    pub struct EventFlags(u32);
);

type Chain = SmallVec<[Label; 4]>;

#[derive(Clone, Debug)]
pub(crate) struct Event {
    id: Id,
    label: Label,
    priority: u8,
    config: Option<Config>,
    #[allow(dead_code)]
    flags: EventFlags,
    chains: [Chain; ActionType::COUNT],
}

impl Event {
    pub fn new(id: Id, label: Label, priority: u8, config: Option<Config>, flags: EventFlags) -> Self {
        Self {
            id,
            label,
            priority,
            config,
            flags,
            chains: core::array::from_fn(|_| Chain::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    #[inline]
    pub fn label(&self) -> &Label {
        &self.label
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    #[inline]
    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    #[inline]
    pub fn chain(&self, action_type: ActionType) -> &[Label] {
        &self.chains[action_type.index()]
    }

    pub fn chain_append(&mut self, action_type: ActionType, action: Label) {
        self.chains[action_type.index()].push(action);
    }

    pub fn chain_prepend(&mut self, action_type: ActionType, action: Label) {
        self.chains[action_type.index()].insert(0, action);
    }

    /// Removes the first occurrence of `action` from the chain.
    pub fn chain_delete(&mut self, action_type: ActionType, action: &str) -> Result<()> {
        let chain = &mut self.chains[action_type.index()];
        let position = chain
            .iter()
            .position(|label| label.as_str() == action)
            .ok_or(Error::ItemNotFound)?;
        chain.remove(position);
        Ok(())
    }

    /// All chain entries across action types, for reference bookkeeping.
    pub fn all_chain_actions(&self) -> impl Iterator<Item = &Label> {
        self.chains.iter().flatten()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct EventTable {
    ents: HashMap<Label, Event>,
}

impl EventTable {
    pub fn new() -> Self {
        Self {
            ents: HashMap::new(),
        }
    }

    pub fn insert(&mut self, event: Event) -> Result<()> {
        match self.ents.entry(event.label().clone()) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(Error::ItemAlreadyPresent),
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(event);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, label: &str) -> Result<Event> {
        self.ents.remove(label).ok_or(Error::ItemNotFound)
    }

    pub fn get(&self, label: &str) -> Result<&Event> {
        self.ents.get(label).ok_or(Error::ItemNotFound)
    }

    pub fn get_mut(&mut self, label: &str) -> Result<&mut Event> {
        self.ents.get_mut(label).ok_or(Error::ItemNotFound)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.ents.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.ents.len()
    }
}
