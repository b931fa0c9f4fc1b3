// Copyright 2026 The dutctl Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `RunContext` is the cancellable signal shared by a run's worker pair and
//! its module chain. It carries no data, only cancellation: `cancel()` is
//! idempotent and broadcasts to every clone, which is what lets the to-client
//! and from-client workers and the module-pipeline FSM all observe the same
//! shutdown without a back-pointer to the Broker that owns them.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crossbeam_channel::{Receiver, Sender};

#[derive(Clone)]
pub struct RunContext {
    cancelled: Arc<AtomicBool>,
    // Closed (by dropping the sender) when `cancel` is called, so worker
    // loops can `select!` on cancellation instead of only polling
    // `is_cancelled` between blocking operations.
    cancel_tx: Arc<Mutex<Option<Sender<()>>>>,
    cancel_rx: Receiver<()>,
}

impl RunContext {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);
        RunContext {
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_tx: Arc::new(Mutex::new(Some(cancel_tx))),
            cancel_rx,
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_tx.lock().unwrap().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A receiver that becomes ready (with a `RecvError`, since it's never
    /// sent on, only closed) once `cancel` has been called. Intended for
    /// `crossbeam_channel::select!` in worker loops.
    pub fn cancel_rx(&self) -> Receiver<()> {
        self.cancel_rx.clone()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancel_is_visible_to_clones() {
        let ctx = RunContext::new();
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());
        ctx.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let ctx = RunContext::new();
        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }
}
