//! Table-driven finite state machine.
//!
//! Transitions are plain ordered lists checked linearly. The first entry whose
//! name matches and whose `from` is either unset or equal to the current state
//! wins, so wildcard entries must come after the specific ones they shadow.

use std::collections::VecDeque;
use std::fmt::Debug;
use tracing::warn;

const HISTORY_LEN: usize = 16;

/// One row of a transition table.
#[derive(Debug, Clone, Copy)]
pub struct Transition<S, N, H> {
    /// Transition name.
    pub name: N,
    /// Required current state, or `None` to match any state.
    pub from: Option<S>,
    /// Resulting state.
    pub to: S,
    /// Side effect the owner runs after the state changed.
    pub handler: Option<H>,
    /// Whether `to` is an end state.
    pub end: bool,
}

impl<S, N, H> Transition<S, N, H> {
    /// Creates a transition between two states.
    pub const fn new(name: N, from: S, to: S) -> Self {
        Self {
            name,
            from: Some(from),
            to,
            handler: None,
            end: false,
        }
    }

    /// Creates a transition taken from any state.
    pub const fn from_any(name: N, to: S) -> Self {
        Self {
            name,
            from: None,
            to,
            handler: None,
            end: false,
        }
    }

    /// Creates a transition between two states with a side effect.
    pub const fn handled(name: N, from: S, to: S, handler: H) -> Self {
        Self {
            name,
            from: Some(from),
            to,
            handler: Some(handler),
            end: false,
        }
    }

    /// Creates a transition from any state with a side effect.
    pub const fn any_handled(name: N, to: S, handler: H) -> Self {
        Self {
            name,
            from: None,
            to,
            handler: Some(handler),
            end: false,
        }
    }

    /// Creates a transition into an end state.
    pub const fn terminal(name: N, from: Option<S>, to: S, handler: Option<H>) -> Self {
        Self {
            name,
            from,
            to,
            handler,
            end: true,
        }
    }
}

/// Outcome of a successful transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange<S, H> {
    /// State before the transition.
    pub from: S,
    /// State after the transition.
    pub to: S,
    /// Side effect to run.
    pub handler: Option<H>,
    /// Whether `to` is an end state.
    pub end: bool,
}

impl<S: PartialEq, H> StateChange<S, H> {
    /// Returns true if the state actually changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// A state machine over a static transition table.
#[derive(Debug)]
pub struct StateMachine<S: 'static, N: 'static, H: 'static> {
    label: &'static str,
    state: S,
    table: &'static [Transition<S, N, H>],
    history: VecDeque<(S, N, S)>,
}

impl<S, N, H> StateMachine<S, N, H>
where
    S: Copy + PartialEq + Debug,
    N: Copy + PartialEq + Debug,
    H: Copy,
{
    /// Creates a machine in `initial` state.
    pub fn new(label: &'static str, initial: S, table: &'static [Transition<S, N, H>]) -> Self {
        Self {
            label,
            state: initial,
            table,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> S {
        self.state
    }

    /// Returns the most recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &(S, N, S)> {
        self.history.iter()
    }

    /// Returns true if a transition named `name` is valid now.
    pub fn can(&self, name: N) -> bool {
        self.find(name).is_some()
    }

    /// Applies the transition named `name`.
    ///
    /// Returns `None` and logs the recent history if no row matches; the
    /// state is left unchanged in that case.
    pub fn transition(&mut self, name: N) -> Option<StateChange<S, H>> {
        let Some(row) = self.find(name) else {
            warn!(
                machine = self.label,
                state = ?self.state,
                transition = ?name,
                history = ?self.history,
                "invalid state transition"
            );
            return None;
        };

        let from = self.state;
        self.state = row.to;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((from, name, row.to));

        Some(StateChange {
            from,
            to: row.to,
            handler: row.handler,
            end: row.end,
        })
    }

    fn find(&self, name: N) -> Option<&'static Transition<S, N, H>> {
        self.table
            .iter()
            .find(|row| row.name == name && row.from.map_or(true, |from| from == self.state))
    }
}
