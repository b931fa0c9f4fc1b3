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

//! A small generic driver for context-cancellable state machines. The
//! module-execution pipeline (see `pipeline.rs`) is its only user, but the
//! driver itself knows nothing about modules.

use crate::context::RunContext;

/// One step of a state machine: given the context and the current args,
/// either hands back the next state to run or signals termination by
/// returning `Ok((args, None))`.
pub trait State<A> {
    fn step(self: Box<Self>, ctx: &RunContext, args: A) -> anyhow::Result<(A, Option<Box<dyn State<A>>>)>;
}

/// Runs `start` to completion: repeatedly invokes the current state against
/// `ctx`/`args`, threading the returned args into the next state, until a
/// state returns `None` (success), an error propagates, or `ctx` is
/// cancelled. No state runs after termination, and states never run
/// concurrently.
pub fn run<A>(ctx: &RunContext, args: A, start: Box<dyn State<A>>) -> anyhow::Result<A> {
    let mut state = start;
    let mut args = args;
    loop {
        if ctx.is_cancelled() {
            anyhow::bail!("run context cancelled");
        }
        let (next_args, next_state) = state.step(ctx, args)?;
        args = next_args;
        match next_state {
            Some(s) => state = s,
            None => return Ok(args),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Counter(u32);
    impl State<u32> for Counter {
        fn step(
            self: Box<Self>,
            _ctx: &RunContext,
            args: u32,
        ) -> anyhow::Result<(u32, Option<Box<dyn State<u32>>>)> {
            let n = args + 1;
            if n >= self.0 {
                Ok((n, None))
            } else {
                Ok((n, Some(Box::new(Counter(self.0)))))
            }
        }
    }

    struct Failing;
    impl State<u32> for Failing {
        fn step(
            self: Box<Self>,
            _ctx: &RunContext,
            _args: u32,
        ) -> anyhow::Result<(u32, Option<Box<dyn State<u32>>>)> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn runs_until_terminal_state() {
        let ctx = RunContext::new();
        let got = run(&ctx, 0u32, Box::new(Counter(3))).unwrap();
        assert_eq!(got, 3);
    }

    #[test]
    fn propagates_state_error() {
        let ctx = RunContext::new();
        assert!(run(&ctx, 0u32, Box::new(Failing)).is_err());
    }

    #[test]
    fn cancelled_context_aborts_before_next_step() {
        let ctx = RunContext::new();
        ctx.cancel();
        assert!(run(&ctx, 0u32, Box::new(Counter(3))).is_err());
    }
}
