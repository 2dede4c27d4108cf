// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! JSON-fed configuration for the flowgate policy engine.
//!
//! The loader consumes a byte stream describing actions, events, static
//! routes, and default policies, and turns it into `flowgate-core` calls.
//! The core crate never parses JSON; this crate never reaches into engine
//! internals.
//!
//! Three load modes mirror the engine's reload contract:
//!
//! - [`LoadMode::DryRun`] validates the document against a scratch clone of
//!   the live context and discards it;
//! - [`LoadMode::LoadThenCommit`] builds into a clone with strict duplicate
//!   rejection and atomically exchanges it with the live context on
//!   success. Committing the same document twice without an intervening
//!   reload fails, because the second build collides with the definitions
//!   the first one installed;
//! - [`LoadMode::Incremental`] applies records directly to the live
//!   context, refreshing records that already exist.
//!
//! Actions declared here are registered with the engine's no-op handler;
//! real callbacks are code and must be installed programmatically before
//! the chains that name them are loaded.

mod model;

use flowgate_core::{
    action::{ActionFlags, ActionResults, NoopAction},
    event::EventFlags,
    Context, Error,
};
use model::Document;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadMode {
    DryRun,
    LoadThenCommit,
    #[default]
    Incremental,
}

/// A failed load: the engine error plus whatever detail the parser or
/// record validation could add.
#[derive(Debug)]
pub struct LoadError {
    kind: Error,
    detail: String,
}

impl LoadError {
    pub fn kind(&self) -> Error {
        self.kind
    }

    fn new(kind: Error, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if self.detail.is_empty() {
            write!(f, "config load failed: {}", self.kind)
        } else {
            write!(f, "config load failed: {}: {}", self.kind, self.detail)
        }
    }
}

impl std::error::Error for LoadError {}

impl From<Error> for LoadError {
    fn from(kind: Error) -> Self {
        Self::new(kind, "")
    }
}

pub type LoadResult<T> = core::result::Result<T, LoadError>;

/// Streaming front end: feed chunks as they arrive, then finish against a
/// context. The document is parsed as a whole at finish time.
#[derive(Debug, Default)]
pub struct Loader {
    mode: LoadMode,
    buf: Vec<u8>,
}

impl Loader {
    pub fn new(mode: LoadMode) -> Self {
        Self {
            mode,
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn finish(self, ctx: &Context) -> LoadResult<()> {
        let document: Document = serde_json::from_slice(&self.buf)
            .map_err(|err| LoadError::new(Error::InvalidArg, err.to_string()))?;
        debug!(mode = ?self.mode, "applying configuration document");
        match self.mode {
            LoadMode::DryRun => {
                let scratch = ctx.clone_as_at_creation()?;
                apply(&scratch, &document, true)
            }
            LoadMode::LoadThenCommit => {
                let staging = ctx.clone_as_at_creation()?;
                apply(&staging, &document, true)?;
                Context::exchange(ctx, &staging)?;
                Ok(())
            }
            LoadMode::Incremental => apply(ctx, &document, false),
        }
    }
}

/// One-shot convenience over [`Loader`].
pub fn load(ctx: &Context, bytes: &[u8], mode: LoadMode) -> LoadResult<()> {
    let mut loader = Loader::new(mode);
    loader.feed(bytes);
    loader.finish(ctx)
}

fn apply(ctx: &Context, document: &Document, strict: bool) -> LoadResult<()> {
    // actions first: event chains name them
    for record in &document.actions {
        let flags = if record.disabled {
            ActionFlags::DISABLED
        } else {
            ActionFlags::NONE
        };
        match ctx.action_insert(&record.label, flags, Arc::new(NoopAction)) {
            Ok(_) => {}
            Err(Error::ItemAlreadyPresent) if !strict => {
                // refresh the flags, keep whatever handler is installed
                ctx.action_update_flags(
                    &record.label,
                    flags,
                    ActionFlags::DISABLED.difference(flags),
                )
                .map_err(|err| at(err, "actions-insert", &record.label))?;
            }
            Err(err) => return Err(at(err, "actions-insert", &record.label)),
        }
    }

    for record in &document.events {
        let config = record
            .config
            .as_ref()
            .map(|config| config.resolve(ctx.config()));
        match ctx.event_insert(&record.label, record.priority, config, EventFlags::NONE) {
            Ok(_) => {}
            Err(Error::ItemAlreadyPresent) if !strict => {
                // replace the definition wholesale
                ctx.event_delete(&record.label)
                    .and_then(|()| {
                        ctx.event_insert(&record.label, record.priority, config, EventFlags::NONE)
                    })
                    .map_err(|err| at(err, "events-insert", &record.label))?;
            }
            Err(err) => return Err(at(err, "events-insert", &record.label)),
        }
        for (action_type, chain) in record.chains() {
            for action in chain {
                ctx.event_action_append(&record.label, action_type, action)
                    .map_err(|err| at(err, "events-insert", &record.label))?;
            }
        }
    }

    for (index, record) in document.routes.iter().enumerate() {
        let (remote, local, flags) = record
            .resolve()
            .map_err(|err| at(err.kind, "static-routes-insert", &index.to_string()))?;
        match ctx.route_insert(
            &remote,
            &local,
            flags,
            record.parent_event.as_deref(),
            None,
        ) {
            Ok(_) => {}
            Err(Error::ItemAlreadyPresent) if !strict => {}
            Err(err) => return Err(at(err, "static-routes-insert", &index.to_string())),
        }
    }

    if let Some(policies) = &document.default_policies {
        if let Some(policy) = &policies.static_routes {
            let bits = match policy.as_str() {
                "accept" => ActionResults::ACCEPT,
                "reject" => ActionResults::REJECT,
                other => {
                    return Err(LoadError::new(
                        Error::InvalidArg,
                        format!("default-policies: unknown policy {other:?}"),
                    ))
                }
            };
            ctx.default_policy_set(bits)
                .map_err(|err| at(err, "default-policies", policy))?;
        }
    }

    Ok(())
}

fn at(kind: Error, section: &str, item: &str) -> LoadError {
    LoadError::new(kind, format!("{section}: {item}"))
}
