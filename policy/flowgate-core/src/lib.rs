// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Embeddable network-policy engine.
//!
//! Callers register labelled [`event`]s and [`action`]s on a [`Context`],
//! insert [`route`]s describing endpoint-pair patterns, and then call
//! [`Context::dispatch`] with concrete endpoint tuples. The engine selects
//! the most specific matching route, runs the relevant action chains, and
//! reports the aggregated [`action::ActionResults`] together with the
//! wildcard bits it had to use to satisfy the query.
//!
//! All state lives in the `Context`; nothing is persisted. A `Context` is
//! safe to share across threads: readers and dispatchers take its internal
//! lock shared, mutators take it exclusive.

pub mod action;
pub mod context;
pub mod error;
pub mod event;
pub mod hpi;
pub mod inet;
pub mod label;
pub mod route;
pub mod sync;
pub mod time;

mod dispatch;
mod id;
mod macros;

pub use crate::{
    context::{Config, Context, Dispatch},
    error::{Error, Result},
    id::Id,
};
