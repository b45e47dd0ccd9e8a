// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Background write-back control.
//!
//! The instrumented engine defers the post-commit mirror copy of a lossy
//! checkpoint to a dedicated thread so the mutator resumes immediately after
//! the commit point. The thread cycles through
//! `Idle -> Started -> Running -> Exiting -> Idle`, guarded by a mutex and
//! condvar; cancellation sets `running = false`, notifies, and joins on
//! drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBackState {
    Idle,
    Started,
    Running,
    Exiting,
}

pub struct Background {
    state: Mutex<WriteBackState>,
    cond: Condvar,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Background {
    pub fn new() -> Background {
        Background {
            state: Mutex::new(WriteBackState::Idle),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            handle: Mutex::new(None),
        }
    }

    pub fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock().expect("background handle") = Some(handle);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Leader side: hand the mirror work to the thread.
    pub fn start(&self) {
        let mut state = self.state.lock().expect("background state");
        *state = WriteBackState::Started;
        self.cond.notify_all();
    }

    /// Thread side: block until there is work or the engine shuts down.
    /// Returns false on shutdown.
    pub fn await_work(&self) -> bool {
        let mut state = self.state.lock().expect("background state");
        loop {
            if !self.is_running() {
                return false;
            }
            if *state == WriteBackState::Started {
                *state = WriteBackState::Running;
                return true;
            }
            state = self.cond.wait(state).expect("background state");
        }
    }

    /// Thread side: mark the mirror finished. A `start` that arrived while
    /// the mirror was running is preserved so the work is not lost.
    pub fn finish(&self) {
        let mut state = self.state.lock().expect("background state");
        if *state == WriteBackState::Running {
            *state = WriteBackState::Exiting;
            *state = WriteBackState::Idle;
        }
        self.cond.notify_all();
    }

    /// Block until the thread is idle.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock().expect("background state");
        while *state != WriteBackState::Idle {
            state = self.cond.wait(state).expect("background state");
        }
    }

    pub fn state(&self) -> WriteBackState {
        *self.state.lock().expect("background state")
    }

    /// Stop and join the thread. Safe to call more than once.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        {
            let _state = self.state.lock().expect("background state");
            self.cond.notify_all();
        }
        let handle = self.handle.lock().expect("background handle").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Default for Background {
    fn default() -> Self {
        Background::new()
    }
}

#[cfg(test)]
mod t_background {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn work_cycles_and_shuts_down() {
        let bg = Arc::new(Background::new());
        let done = Arc::new(AtomicUsize::new(0));

        let thread_bg = bg.clone();
        let thread_done = done.clone();
        let handle = std::thread::spawn(move || {
            while thread_bg.await_work() {
                thread_done.fetch_add(1, Ordering::SeqCst);
                thread_bg.finish();
            }
        });
        bg.set_handle(handle);

        for _ in 0..3 {
            bg.start();
            bg.wait_idle();
        }
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(bg.state(), WriteBackState::Idle);

        bg.shutdown();
        // Idempotent shutdown.
        bg.shutdown();
    }
}
