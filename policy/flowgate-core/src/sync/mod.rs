// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Synchronization primitives.

pub mod rwlock;

pub use rwlock::Rwlock;
