// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reader–writer lock with writer preference and an upgrade reservation
//! protocol.
//!
//! The host OS lock cannot express an atomic shared→exclusive upgrade, so
//! the engine carries its own: a reader that discovers mid-read that it
//! must mutate registers a *reservation* while still holding shared, lets
//! the other readers drain, and then *redeems* the reservation for the
//! exclusive lock without ever releasing. At most one reservation can be
//! outstanding per lock, which is what makes the upgrade deadlock-free.
//!
//! The lock is a single state record guarded by a `Mutex`, with one condvar
//! per waiter class. Acquisition ordering guarantees:
//!
//! - a pending exclusive waiter blocks new shared acquisitions, so writers
//!   cannot starve;
//! - a granted reservation blocks new shared acquisitions (existing shared
//!   holders drain normally) and outranks every newly arriving waiter at
//!   redeem time;
//! - downgrading runs inside one critical section, so no writer can slip
//!   in between the exclusive release and the shared re-entry.
//!
//! Every operation reports misuse (`InvalidState`, `Already`,
//! `IncompatibleState`) as an error return rather than panicking or going
//! undefined. Timed variants distinguish try-lock failure (`Busy`, zero
//! timeout) from an expired wait (`TimedOut`).

use crate::error::{Error, Result};
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

#[derive(Debug)]
struct State {
    /// Number of threads currently holding the lock shared.
    shared: usize,
    /// Thread currently holding the lock exclusively.
    exclusive: Option<ThreadId>,
    /// Threads blocked waiting for exclusive acquisition. Nonzero holds off
    /// new shared acquisitions.
    write_waiters: usize,
    /// Holder of the outstanding shared→exclusive reservation, if any.
    /// Blocking `shared2mutex` takes this implicitly for the duration of
    /// its wait.
    reservation: Option<ThreadId>,
    /// The reservation holder is blocked waiting for the other shared
    /// holders to drain.
    redeeming: bool,
}

#[derive(Debug)]
pub struct Rwlock {
    state: Mutex<State>,
    readers: Condvar,
    writers: Condvar,
    upgrader: Condvar,
}

impl Default for Rwlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Rwlock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                shared: 0,
                exclusive: None,
                write_waiters: 0,
                reservation: None,
                redeeming: false,
            }),
            readers: Condvar::new(),
            writers: Condvar::new(),
            upgrader: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // a poisoning panic can only come from a host callback; the state
        // record itself is always consistent between critical sections
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn can_share(state: &State) -> bool {
        state.exclusive.is_none() && state.write_waiters == 0 && state.reservation.is_none()
    }

    fn can_write(state: &State) -> bool {
        state.exclusive.is_none() && state.shared == 0 && state.reservation.is_none()
    }

    /// Wakes whichever waiter class the current state can admit.
    fn wake(&self, state: &State) {
        if state.exclusive.is_some() {
            return;
        }
        if state.reservation.is_some() {
            // the reservation outranks everyone else; nothing new may enter
            if state.redeeming && state.shared <= 1 {
                self.upgrader.notify_one();
            }
            return;
        }
        if state.write_waiters > 0 {
            if state.shared == 0 {
                self.writers.notify_all();
            }
            // readers keep waiting while a writer is pending
            return;
        }
        self.readers.notify_all();
    }

    /// Blocks on `condvar`, honoring an optional deadline.
    fn wait_on<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, State>,
        deadline: Option<Instant>,
    ) -> core::result::Result<MutexGuard<'a, State>, Error> {
        match deadline {
            None => Ok(condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::TimedOut);
                }
                let (guard, _) = condvar
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(guard)
            }
        }
    }

    /// Acquires the lock shared, waiting as long as it takes.
    pub fn shared(&self) -> Result<()> {
        self.shared_deadline(None)
    }

    /// Acquires the lock shared with a wait bound. A zero `max_wait` is a
    /// try-lock: `Busy` on any contention. Expiry reports `TimedOut`.
    pub fn shared_timed(&self, max_wait: Duration) -> Result<()> {
        if max_wait.is_zero() {
            let mut state = self.state();
            if state.exclusive == Some(thread::current().id()) {
                return Err(Error::Already);
            }
            if Self::can_share(&state) {
                state.shared += 1;
                Ok(())
            } else {
                Err(Error::Busy)
            }
        } else {
            self.shared_deadline(Some(Instant::now() + max_wait))
        }
    }

    fn shared_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            return Err(Error::Already);
        }
        while !Self::can_share(&state) {
            state = self.wait_on(&self.readers, state, deadline)?;
        }
        state.shared += 1;
        Ok(())
    }

    /// Acquires the lock exclusively, waiting as long as it takes.
    pub fn mutex(&self) -> Result<()> {
        self.mutex_deadline(None)
    }

    /// Exclusive acquisition with a wait bound; zero means try-lock.
    pub fn mutex_timed(&self, max_wait: Duration) -> Result<()> {
        if max_wait.is_zero() {
            let mut state = self.state();
            if state.exclusive == Some(thread::current().id()) {
                return Err(Error::Already);
            }
            if Self::can_write(&state) {
                state.exclusive = Some(thread::current().id());
                Ok(())
            } else {
                Err(Error::Busy)
            }
        } else {
            self.mutex_deadline(Some(Instant::now() + max_wait))
        }
    }

    fn mutex_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            return Err(Error::Already);
        }
        if Self::can_write(&state) {
            state.exclusive = Some(me);
            return Ok(());
        }
        state.write_waiters += 1;
        loop {
            match self.wait_on(&self.writers, state, deadline) {
                Ok(guard) => state = guard,
                Err(err) => {
                    let mut state = self.state();
                    state.write_waiters -= 1;
                    // our pending-writer flag may have been the only thing
                    // holding readers off
                    self.wake(&state);
                    return Err(err);
                }
            }
            if Self::can_write(&state) {
                state.write_waiters -= 1;
                state.exclusive = Some(me);
                return Ok(());
            }
        }
    }

    /// Releases whatever hold the calling thread has. `InvalidState` if it
    /// holds nothing. Releasing shared while holding a reservation abandons
    /// the reservation.
    pub fn unlock(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            state.exclusive = None;
            if state.reservation == Some(me) {
                state.reservation = None;
                state.redeeming = false;
            }
            self.wake(&state);
            return Ok(());
        }
        if state.shared > 0 {
            state.shared -= 1;
            if state.reservation == Some(me) {
                state.reservation = None;
                state.redeeming = false;
            }
            self.wake(&state);
            return Ok(());
        }
        Err(Error::InvalidState)
    }

    /// Downgrades exclusive to shared without releasing.
    pub fn mutex2shared(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive != Some(me) {
            return Err(Error::InvalidState);
        }
        debug_assert!(state.reservation.is_none());
        state.exclusive = None;
        state.shared = 1;
        self.wake(&state);
        Ok(())
    }

    /// Atomic downgrade that keeps the upgrade path reserved: the caller
    /// ends up shared with the reservation in hand.
    pub fn mutex2shared_and_reserve_shared2mutex(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive != Some(me) {
            return Err(Error::InvalidState);
        }
        debug_assert!(state.reservation.is_none());
        state.exclusive = None;
        state.shared = 1;
        state.reservation = Some(me);
        state.redeeming = false;
        self.wake(&state);
        Ok(())
    }

    /// Upgrades shared to exclusive, waiting for the other shared holders
    /// to drain. `Busy` if another thread's upgrade is already outstanding;
    /// `Already` if the caller holds exclusive.
    pub fn shared2mutex(&self) -> Result<()> {
        self.upgrade_deadline(None)
    }

    /// Timed upgrade; zero means `Busy` unless immediately possible.
    pub fn shared2mutex_timed(&self, max_wait: Duration) -> Result<()> {
        if max_wait.is_zero() {
            let me = thread::current().id();
            let mut state = self.state();
            if state.exclusive == Some(me) {
                return Err(Error::Already);
            }
            if state.shared == 0 {
                return Err(Error::InvalidState);
            }
            if state.reservation.is_some() {
                return Err(Error::Busy);
            }
            if state.shared == 1 {
                state.shared = 0;
                state.exclusive = Some(me);
                Ok(())
            } else {
                Err(Error::Busy)
            }
        } else {
            self.upgrade_deadline(Some(Instant::now() + max_wait))
        }
    }

    fn upgrade_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            return Err(Error::Already);
        }
        if state.shared == 0 {
            return Err(Error::InvalidState);
        }
        if state.reservation.is_some() {
            return Err(Error::Busy);
        }
        // hold the reservation for the duration of the wait so no competing
        // upgrade can start and new readers hold off
        state.reservation = Some(me);
        state.redeeming = true;
        self.redeem_wait(state, deadline, false)
    }

    /// Registers intent to upgrade while holding shared. At most one
    /// reservation may be outstanding on a lock.
    pub fn shared2mutex_reserve(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) || state.reservation == Some(me) {
            return Err(Error::Already);
        }
        if state.shared == 0 {
            return Err(Error::InvalidState);
        }
        if state.reservation.is_some() {
            return Err(Error::Busy);
        }
        state.reservation = Some(me);
        Ok(())
    }

    /// Converts an outstanding reservation to the exclusive lock, waiting
    /// for the other shared holders to drop.
    pub fn shared2mutex_redeem(&self) -> Result<()> {
        self.redeem_deadline(None)
    }

    /// Timed redeem; zero means `Busy` unless immediately possible, and the
    /// reservation stays in place on failure.
    pub fn shared2mutex_redeem_timed(&self, max_wait: Duration) -> Result<()> {
        if max_wait.is_zero() {
            let me = thread::current().id();
            let mut state = self.state();
            if state.exclusive == Some(me) {
                return Err(Error::Already);
            }
            if state.reservation != Some(me) {
                return Err(Error::IncompatibleState);
            }
            if state.shared == 1 {
                state.shared = 0;
                state.exclusive = Some(me);
                state.reservation = None;
                state.redeeming = false;
                Ok(())
            } else {
                Err(Error::Busy)
            }
        } else {
            self.redeem_deadline(Some(Instant::now() + max_wait))
        }
    }

    fn redeem_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            return Err(Error::Already);
        }
        if state.reservation != Some(me) {
            return Err(Error::IncompatibleState);
        }
        if state.shared == 0 {
            return Err(Error::InvalidState);
        }
        state.redeeming = true;
        self.redeem_wait(state, deadline, true)
    }

    /// Waits (with the reservation held) until the caller is the sole
    /// shared holder, then swaps shared for exclusive.
    fn redeem_wait(
        &self,
        mut state: MutexGuard<'_, State>,
        deadline: Option<Instant>,
        keep_reservation_on_timeout: bool,
    ) -> Result<()> {
        let me = thread::current().id();
        loop {
            if state.shared == 1 {
                state.shared = 0;
                state.exclusive = Some(me);
                state.reservation = None;
                state.redeeming = false;
                return Ok(());
            }
            match self.wait_on(&self.upgrader, state, deadline) {
                Ok(guard) => state = guard,
                Err(err) => {
                    let mut state = self.state();
                    state.redeeming = false;
                    if !keep_reservation_on_timeout {
                        state.reservation = None;
                    }
                    self.wake(&state);
                    return Err(err);
                }
            }
        }
    }

    /// Drops an outstanding reservation without upgrading; the caller keeps
    /// its shared hold.
    pub fn shared2mutex_abandon(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            return Err(Error::Already);
        }
        if state.reservation != Some(me) {
            return Err(Error::IncompatibleState);
        }
        state.reservation = None;
        state.redeeming = false;
        self.wake(&state);
        Ok(())
    }

    /// Acquires shared and takes the reservation in one atomic step.
    pub fn shared_and_reserve_shared2mutex(&self) -> Result<()> {
        self.shared_reserve_deadline(None)
    }

    /// Timed form of [`shared_and_reserve_shared2mutex`]; zero means
    /// try-acquire.
    ///
    /// [`shared_and_reserve_shared2mutex`]: Self::shared_and_reserve_shared2mutex
    pub fn shared_timed_and_reserve_shared2mutex(&self, max_wait: Duration) -> Result<()> {
        if max_wait.is_zero() {
            let me = thread::current().id();
            let mut state = self.state();
            if state.exclusive == Some(me) {
                return Err(Error::Already);
            }
            if Self::can_share(&state) {
                state.shared += 1;
                state.reservation = Some(me);
                Ok(())
            } else {
                Err(Error::Busy)
            }
        } else {
            self.shared_reserve_deadline(Some(Instant::now() + max_wait))
        }
    }

    fn shared_reserve_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            return Err(Error::Already);
        }
        // can_share already requires the reservation slot to be free
        while !Self::can_share(&state) {
            state = self.wait_on(&self.readers, state, deadline)?;
        }
        state.shared += 1;
        state.reservation = Some(me);
        Ok(())
    }

    /// `Ok` if the lock is currently held shared by anyone.
    pub fn have_shared(&self) -> Result<()> {
        if self.state().shared > 0 {
            Ok(())
        } else {
            Err(Error::NotOk)
        }
    }

    /// `Ok` if the calling thread holds the lock exclusively.
    pub fn have_mutex(&self) -> Result<()> {
        if self.state().exclusive == Some(thread::current().id()) {
            Ok(())
        } else {
            Err(Error::NotOk)
        }
    }
}
