// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Event and action registry coverage: label validation, flag updates,
//! chain execution order, connection-count limits, and context cloning.

use flowgate_core::{
    action::{ActionContext, ActionFlags, ActionResults, ActionType, NoopAction},
    event::EventFlags,
    inet::{Endpoint, Protocol},
    label::MAX_LABEL_BYTES,
    route::RouteFlags,
    Config, Context, Error, Result,
};
use std::sync::{Arc, Mutex};

fn context() -> Context {
    Context::new(
        None,
        Config {
            route_private_data_size: 32,
            route_private_data_alignment: 8,
            max_connection_count: 10,
        },
    )
    .unwrap()
}

fn noop() -> Arc<NoopAction> {
    Arc::new(NoopAction)
}

fn ep(addr: [u8; 4], port: u16) -> Endpoint {
    Endpoint::inet(Protocol::TCP, addr, port, 1)
}

#[test]
fn event_and_action_registration() {
    let ctx = context();

    for label in [
        "connect",
        "connection_refused",
        "disconnect",
        "authentication_succeeded",
        "authentication_failed",
        "negotiation_abandoned",
    ] {
        ctx.event_insert(label, 10, None, EventFlags::NONE).unwrap();
    }
    assert_eq!(
        ctx.event_insert("connect", 10, None, EventFlags::NONE).err(),
        Some(Error::ItemAlreadyPresent)
    );
    assert_eq!(ctx.event_priority("connect").unwrap(), 10);
    assert_eq!(
        ctx.event_priority("no_such_event").err(),
        Some(Error::ItemNotFound)
    );

    ctx.action_insert("insert_always", ActionFlags::NONE, noop())
        .unwrap();
    ctx.action_insert("insert_alway", ActionFlags::NONE, noop())
        .unwrap();

    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn label_validation_grid() {
    let ctx = context();
    let too_long = "x".repeat(MAX_LABEL_BYTES + 1);
    let exact_fit = "x".repeat(MAX_LABEL_BYTES);

    assert_eq!(
        ctx.action_insert(&too_long, ActionFlags::NONE, noop()).err(),
        Some(Error::StringArgTooLong)
    );
    assert_eq!(
        ctx.action_insert("", ActionFlags::NONE, noop()).err(),
        Some(Error::InvalidArg)
    );
    ctx.action_insert(&exact_fit, ActionFlags::NONE, noop())
        .unwrap();
    assert_eq!(
        ctx.action_insert(&exact_fit, ActionFlags::NONE, noop()).err(),
        Some(Error::ItemAlreadyPresent)
    );

    assert_eq!(
        ctx.action_delete(&too_long).err(),
        Some(Error::StringArgTooLong)
    );
    assert_eq!(ctx.action_delete("").err(), Some(Error::InvalidArg));
    ctx.action_delete(&exact_fit).unwrap();
    assert_eq!(
        ctx.action_delete(&exact_fit).err(),
        Some(Error::ItemNotFound)
    );

    // lookups run the same validation
    assert_eq!(
        ctx.action_get_flags("no_such_action").err(),
        Some(Error::ItemNotFound)
    );
    assert_eq!(
        ctx.action_get_flags(&too_long).err(),
        Some(Error::StringArgTooLong)
    );
    assert_eq!(ctx.action_get_flags("").err(), Some(Error::InvalidArg));

    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn action_flag_updates_snapshot_before_and_after() {
    let ctx = context();
    ctx.action_insert("check_counts", ActionFlags::NONE, noop())
        .unwrap();

    assert_eq!(
        ctx.action_get_flags("check_counts").unwrap(),
        ActionFlags::NONE
    );

    let (before, after) = ctx
        .action_update_flags("check_counts", ActionFlags::DISABLED, ActionFlags::NONE)
        .unwrap();
    assert_eq!(before, ActionFlags::NONE);
    assert_eq!(after, ActionFlags::DISABLED);
    assert_eq!(
        ctx.action_get_flags("check_counts").unwrap(),
        ActionFlags::DISABLED
    );

    let (before, after) = ctx
        .action_update_flags("check_counts", ActionFlags::NONE, ActionFlags::DISABLED)
        .unwrap();
    assert_eq!(before, ActionFlags::DISABLED);
    assert_eq!(after, ActionFlags::NONE);
    assert_eq!(
        ctx.action_get_flags("check_counts").unwrap(),
        ActionFlags::NONE
    );

    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

/// Records every invocation as "event/action" so chain order is checkable.
fn recording_handler(
    log: Arc<Mutex<Vec<String>>>,
) -> Arc<dyn flowgate_core::action::ActionHandler> {
    Arc::new(
        move |args: &ActionContext<'_>, _results: &mut ActionResults| -> Result<()> {
            let trigger = args.trigger_event.unwrap_or("-");
            log.lock().unwrap().push(format!(
                "{}:{}:{:?}",
                trigger, args.action, args.action_type
            ));
            Ok(())
        },
    )
}

#[test]
fn chains_run_in_priority_and_chain_order() {
    let ctx = context();
    let log = Arc::new(Mutex::new(Vec::new()));

    for action in ["first", "second", "third"] {
        ctx.action_insert(action, ActionFlags::NONE, recording_handler(log.clone()))
            .unwrap();
    }

    // parent at priority 10, trigger at priority 5: trigger runs first
    ctx.event_insert("parent", 10, None, EventFlags::NONE).unwrap();
    ctx.event_insert("trigger", 5, None, EventFlags::NONE).unwrap();
    ctx.event_action_append("parent", ActionType::Match, "second")
        .unwrap();
    ctx.event_action_append("parent", ActionType::Match, "third")
        .unwrap();
    ctx.event_action_prepend("trigger", ActionType::Match, "first")
        .unwrap();

    assert_eq!(
        ctx.event_action_list("parent", ActionType::Match).unwrap(),
        ["second", "third"]
    );

    let remote = ep([10, 0, 0, 1], 40000);
    let local = ep([10, 0, 0, 2], 443);
    let flags = RouteFlags::DIRECTION_IN;
    ctx.route_insert(&remote, &local, flags, Some("parent"), None)
        .unwrap();

    let mut results = ActionResults::NONE;
    let outcome = ctx
        .dispatch(&remote, &local, flags, Some("trigger"), None, &mut results)
        .unwrap();
    assert!(outcome.route_id.is_some());

    let seen = log.lock().unwrap().clone();
    assert_eq!(
        seen,
        [
            "trigger:first:Match",
            "trigger:second:Match",
            "trigger:third:Match"
        ]
    );

    // a disabled action is skipped without disturbing the rest
    log.lock().unwrap().clear();
    ctx.action_update_flags("second", ActionFlags::DISABLED, ActionFlags::NONE)
        .unwrap();
    ctx.dispatch(&remote, &local, flags, Some("trigger"), None, &mut results)
        .unwrap();
    let seen = log.lock().unwrap().clone();
    assert_eq!(seen, ["trigger:first:Match", "trigger:third:Match"]);

    // a named trigger that was never registered is an error
    assert_eq!(
        ctx.dispatch(&remote, &local, flags, Some("ghost"), None, &mut results)
            .err(),
        Some(Error::ItemNotFound)
    );

    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn failing_action_aborts_chain_but_keeps_partial_results() {
    let ctx = context();

    ctx.action_insert(
        "accept_then_fail",
        ActionFlags::NONE,
        Arc::new(
            |_args: &ActionContext<'_>, results: &mut ActionResults| -> Result<()> {
                results.insert(ActionResults::ACCEPT);
                Err(Error::NotOk)
            },
        ),
    )
    .unwrap();
    ctx.action_insert("never_reached", ActionFlags::NONE, noop())
        .unwrap();

    ctx.event_insert("ev", 10, None, EventFlags::NONE).unwrap();
    ctx.event_action_append("ev", ActionType::Match, "accept_then_fail")
        .unwrap();
    ctx.event_action_append("ev", ActionType::Match, "never_reached")
        .unwrap();

    let remote = ep([10, 0, 0, 1], 40000);
    let local = ep([10, 0, 0, 2], 443);
    let flags = RouteFlags::DIRECTION_OUT;
    ctx.route_insert(&remote, &local, flags, Some("ev"), None)
        .unwrap();

    let mut results = ActionResults::NONE;
    assert_eq!(
        ctx.dispatch(&remote, &local, flags, None, None, &mut results)
            .err(),
        Some(Error::NotOk)
    );
    // the bits set before the failure survive
    assert!(results.contains(ActionResults::ACCEPT));

    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn actions_referenced_by_chains_cannot_be_deleted() {
    let ctx = context();
    ctx.action_insert("tracked", ActionFlags::NONE, noop()).unwrap();
    ctx.event_insert("ev", 10, None, EventFlags::NONE).unwrap();
    ctx.event_action_append("ev", ActionType::Match, "tracked")
        .unwrap();

    assert_eq!(ctx.action_delete("tracked").err(), Some(Error::Busy));

    ctx.event_action_delete("ev", ActionType::Match, "tracked")
        .unwrap();
    ctx.action_delete("tracked").unwrap();

    // deleting the event also releases its references
    ctx.action_insert("tracked", ActionFlags::NONE, noop()).unwrap();
    ctx.event_action_append("ev", ActionType::Match, "tracked")
        .unwrap();
    assert_eq!(ctx.action_delete("tracked").err(), Some(Error::Busy));
    ctx.event_delete("ev").unwrap();
    ctx.action_delete("tracked").unwrap();

    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn connection_count_limit_rejects_overflow() {
    let ctx = Context::new(
        None,
        Config {
            route_private_data_size: 0,
            route_private_data_alignment: 0,
            max_connection_count: 3,
        },
    )
    .unwrap();

    ctx.action_insert(
        "open_connection",
        ActionFlags::NONE,
        Arc::new(
            |_args: &ActionContext<'_>, results: &mut ActionResults| -> Result<()> {
                results.insert(ActionResults::CONNECT);
                Ok(())
            },
        ),
    )
    .unwrap();
    ctx.action_insert(
        "close_connection",
        ActionFlags::NONE,
        Arc::new(
            |_args: &ActionContext<'_>, results: &mut ActionResults| -> Result<()> {
                results.insert(ActionResults::DISCONNECT);
                Ok(())
            },
        ),
    )
    .unwrap();

    ctx.event_insert("session_open", 10, None, EventFlags::NONE)
        .unwrap();
    ctx.event_insert("session_close", 10, None, EventFlags::NONE)
        .unwrap();
    ctx.event_action_append("session_open", ActionType::Match, "open_connection")
        .unwrap();
    ctx.event_action_append("session_close", ActionType::Match, "close_connection")
        .unwrap();

    let remote = ep([10, 0, 0, 1], 40000);
    let local = ep([10, 0, 0, 2], 443);
    let flags = RouteFlags::DIRECTION_IN | RouteFlags::GREENLISTED;
    let (id, _) = ctx
        .route_insert(&remote, &local, flags, None, None)
        .unwrap();

    let mut results = ActionResults::NONE;
    let query = RouteFlags::DIRECTION_IN;
    for _ in 0..3 {
        ctx.dispatch(&remote, &local, query, Some("session_open"), None, &mut results)
            .unwrap();
        assert!(results.contains(ActionResults::ACCEPT));
        assert!(!results.contains(ActionResults::REJECT));
    }
    let route = ctx.route_get_reference_by_id(id).unwrap();
    assert_eq!(route.connection_count(), 3);

    // the fourth concurrent connection trips the limit
    ctx.dispatch(&remote, &local, query, Some("session_open"), None, &mut results)
        .unwrap();
    assert!(results.contains(ActionResults::REJECT));
    assert_eq!(route.connection_count(), 3);

    // closing one frees a slot
    ctx.dispatch(&remote, &local, query, Some("session_close"), None, &mut results)
        .unwrap();
    assert_eq!(route.connection_count(), 2);
    ctx.dispatch(&remote, &local, query, Some("session_open"), None, &mut results)
        .unwrap();
    assert!(!results.contains(ActionResults::REJECT));
    assert_eq!(route.connection_count(), 3);

    drop(route);
    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn update_flags_reports_noops_and_runs_update_chain() {
    let ctx = context();
    let log = Arc::new(Mutex::new(Vec::new()));
    ctx.action_insert("observe", ActionFlags::NONE, recording_handler(log.clone()))
        .unwrap();
    ctx.event_insert("ev", 10, None, EventFlags::NONE).unwrap();
    ctx.event_action_append("ev", ActionType::Update, "observe")
        .unwrap();

    let remote = ep([10, 0, 0, 1], 40000);
    let local = ep([10, 0, 0, 2], 443);
    let flags = RouteFlags::DIRECTION_IN;
    let (id, _) = ctx
        .route_insert(&remote, &local, flags, Some("ev"), None)
        .unwrap();

    let (before, after, results) = ctx
        .route_update_flags(id, RouteFlags::PENALTYBOXED, RouteFlags::NONE)
        .unwrap();
    assert_eq!(before, flags);
    assert_eq!(after, flags | RouteFlags::PENALTYBOXED);
    assert!(!results.contains(ActionResults::UPDATE_WAS_A_NOOP));

    let (_, _, results) = ctx
        .route_update_flags(id, RouteFlags::PENALTYBOXED, RouteFlags::NONE)
        .unwrap();
    assert!(results.contains(ActionResults::UPDATE_WAS_A_NOOP));

    // key bits are immutable through this path
    assert_eq!(
        ctx.route_update_flags(id, RouteFlags::DIRECTION_OUT, RouteFlags::NONE)
            .err(),
        Some(Error::InvalidArg)
    );
    // and both dispositions at once stay impossible
    assert_eq!(
        ctx.route_update_flags(id, RouteFlags::GREENLISTED, RouteFlags::NONE)
            .err(),
        Some(Error::InvalidArg)
    );

    assert_eq!(log.lock().unwrap().len(), 2);
    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn insert_chain_can_veto_the_route() {
    let ctx = context();
    ctx.action_insert(
        "refuse_inserts",
        ActionFlags::NONE,
        Arc::new(
            |_args: &ActionContext<'_>, results: &mut ActionResults| -> Result<()> {
                results.insert(ActionResults::REJECT);
                Ok(())
            },
        ),
    )
    .unwrap();
    ctx.event_insert("vetting", 10, None, EventFlags::NONE).unwrap();
    ctx.event_action_append("vetting", ActionType::Insert, "refuse_inserts")
        .unwrap();

    let remote = ep([10, 0, 0, 1], 40000);
    let local = ep([10, 0, 0, 2], 443);
    let (_, results) = ctx
        .route_insert(
            &remote,
            &local,
            RouteFlags::DIRECTION_IN,
            Some("vetting"),
            None,
        )
        .unwrap();
    assert!(results.contains(ActionResults::INSERT_WAS_DELETED));
    assert_eq!(ctx.route_count().unwrap(), 0);

    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn clone_keeps_definitions_and_exchange_swaps_tables() {
    let ctx = context();
    ctx.action_insert("observe", ActionFlags::NONE, noop()).unwrap();
    ctx.event_insert("ev", 10, None, EventFlags::NONE).unwrap();
    ctx.event_action_append("ev", ActionType::Match, "observe")
        .unwrap();

    let remote = ep([10, 0, 0, 1], 40000);
    let local = ep([10, 0, 0, 2], 443);
    let flags = RouteFlags::DIRECTION_IN | RouteFlags::GREENLISTED;
    ctx.route_insert(&remote, &local, flags, Some("ev"), None)
        .unwrap();

    // the clone carries definitions but no routes
    let clone = ctx.clone_as_at_creation().unwrap();
    assert_eq!(clone.route_count().unwrap(), 0);
    assert_eq!(clone.event_priority("ev").unwrap(), 10);
    assert_eq!(
        clone.action_get_flags("observe").unwrap(),
        ActionFlags::NONE
    );
    assert_eq!(
        clone.event_insert("ev", 10, None, EventFlags::NONE).err(),
        Some(Error::ItemAlreadyPresent)
    );

    // fill the clone, then swap it into place
    let clone_remote = ep([172, 16, 0, 1], 9999);
    clone
        .route_insert(&clone_remote, &local, flags, Some("ev"), None)
        .unwrap();
    Context::exchange(&ctx, &clone).unwrap();

    let mut results = ActionResults::NONE;
    let outcome = ctx
        .dispatch(
            &clone_remote,
            &local,
            RouteFlags::DIRECTION_IN,
            None,
            None,
            &mut results,
        )
        .unwrap();
    assert!(outcome.route_id.is_some());
    assert!(results.contains(ActionResults::ACCEPT));

    // the old table now lives in the clone
    let outcome = clone
        .dispatch(&remote, &local, RouteFlags::DIRECTION_IN, None, None, &mut results)
        .unwrap();
    assert!(outcome.route_id.is_some());

    // ids keep advancing across both contexts without collision
    let (id_a, _) = ctx
        .route_insert(&ep([10, 9, 9, 9], 1), &local, flags, None, None)
        .unwrap();
    let (id_b, _) = clone
        .route_insert(&ep([10, 9, 9, 8], 1), &local, flags, None, None)
        .unwrap();
    assert_ne!(id_a, id_b);

    clone.shutdown().map_err(|(_, err)| err).unwrap();
    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}

#[test]
fn default_policy_applies_without_a_match() {
    let ctx = context();
    ctx.default_policy_set(ActionResults::ACCEPT).unwrap();

    let mut results = ActionResults::NONE;
    let outcome = ctx
        .dispatch(
            &ep([10, 0, 0, 1], 40000),
            &ep([10, 0, 0, 2], 443),
            RouteFlags::DIRECTION_IN,
            None,
            None,
            &mut results,
        )
        .unwrap();
    assert_eq!(outcome.route_id, None);
    assert!(results.contains(ActionResults::ACCEPT));

    // only disposition bits are accepted as policy
    assert_eq!(
        ctx.default_policy_set(ActionResults::CONNECT).err(),
        Some(Error::InvalidArg)
    );

    ctx.shutdown().map_err(|(_, err)| err).unwrap();
}
