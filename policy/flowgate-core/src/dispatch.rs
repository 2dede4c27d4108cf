// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Action-chain execution.
//!
//! Every lifecycle point (insert, match, update, delete, decision) runs the
//! same way: collect the route's parent event and the caller's trigger
//! event, order them by priority (parent first on ties), and invoke each
//! enabled action in chain order, aggregating result bits as it goes.

use crate::{
    action::{ActionContext, ActionFlags, ActionResults, ActionType},
    context::{Context, Tables},
    error::{Error, Result},
    event::Event,
    label::Label,
    route::RouteRef,
};
use core::any::Any;
use smallvec::SmallVec;

/// Runs the `action_type` chains of the parent and trigger events against
/// one route, ORing outcome bits into `results`.
///
/// A handler error aborts the remaining chain and propagates; bits set so
/// far stay in `results`. A handler setting `STOP` ends the chain cleanly.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_event_chains(
    context: &Context,
    tables: &Tables,
    route: &RouteRef,
    parent: Option<&Label>,
    trigger: Option<&Label>,
    action_type: ActionType,
    caller_arg: Option<&dyn Any>,
    results: &mut ActionResults,
) -> Result<()> {
    let mut events: SmallVec<[&Event; 2]> = SmallVec::new();
    if let Some(label) = parent {
        // a route may outlive its parent event definition; a missing
        // parent simply contributes no chain
        if let Ok(event) = tables.events.get(label.as_str()) {
            events.push(event);
        }
    }
    if let Some(label) = trigger {
        if parent.map(Label::as_str) != Some(label.as_str()) {
            if let Ok(event) = tables.events.get(label.as_str()) {
                events.push(event);
            }
        }
    }
    // stable: the parent keeps its slot when priorities tie
    events.sort_by_key(|event| event.priority());

    let parent_event = route.parent_event();
    let trigger_event = trigger.map(Label::as_str);
    for event in events {
        for action_label in event.chain(action_type) {
            // chain reference counting keeps every entry resolvable
            let entry = tables
                .actions
                .get(action_label.as_str())
                .map_err(|_| Error::InternalCheckFailed)?;
            if entry.flags().contains(ActionFlags::DISABLED) {
                continue;
            }
            let args = ActionContext {
                context,
                action: action_label.as_str(),
                action_flags: entry.flags(),
                parent_event,
                trigger_event,
                action_type,
                route,
                caller_arg,
            };
            entry.handler().handle(&args, results)?;
            if results.contains(ActionResults::STOP) {
                results.remove(ActionResults::STOP);
                return Ok(());
            }
        }
    }
    Ok(())
}
