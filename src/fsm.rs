//! Table-driven state machine driver.
//!
//! A [`Machine`] names its states, lists the edges it may take, and runs one
//! step per state. The driver owns the control flow: it checks every edge
//! against the table and routes failures through the machine's error and
//! cleanup states, so each step only has to say where to go next or why it
//! could not. The driver knows nothing about what the states do.
//!
//! Failure routing:
//!
//! ```text
//!   any state ──fail──▶ ERROR ──▶ CLEANUP ──▶ EXIT
//!                         │fail      │fail
//!                         └──▶ CLEANUP └──▶ EXIT
//! ```
//!
//! CLEANUP runs at most once per run.

use std::fmt;
use std::panic::Location;
use tracing::{debug, trace};

/// Why a step failed, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub message: String,
    /// Name of the failing step.
    pub step: &'static str,
    pub location: &'static Location<'static>,
}

impl StepError {
    /// Record a failure at the caller's source location.
    #[track_caller]
    pub fn new(step: &'static str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step,
            location: Location::caller(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed: {} ({}:{})",
            self.step,
            self.message,
            self.location.file(),
            self.location.line()
        )
    }
}

impl std::error::Error for StepError {}

/// A permitted edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
}

impl<S> Transition<S> {
    pub const fn new(from: S, to: S) -> Self {
        Self { from, to }
    }
}

/// A state machine the driver can run.
pub trait Machine {
    type State: Copy + Eq + fmt::Debug + 'static;

    const INITIAL: Self::State;
    /// Entered after a step fails.
    const ERROR: Self::State;
    /// Releases resources; entered once from ERROR or at the end of a run.
    const CLEANUP: Self::State;
    /// Terminal. Its step is never run.
    const EXIT: Self::State;

    /// Every edge a step may take. Failure routing edges are implied.
    fn transitions(&self) -> &'static [Transition<Self::State>];

    /// Run the step for `state` and return the next state.
    ///
    /// `error` is the first failure of the run, if any.
    fn step(
        &mut self,
        state: Self::State,
        error: Option<&StepError>,
    ) -> Result<Self::State, StepError>;
}

/// How a run ended.
#[derive(Debug)]
pub struct Outcome<S> {
    /// The first failure, if any step failed.
    pub error: Option<StepError>,
    /// States entered, in order, ending with EXIT.
    pub visited: Vec<S>,
}

impl<S> Outcome<S> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Drive `machine` from INITIAL to EXIT.
pub fn run<M: Machine>(machine: &mut M) -> Outcome<M::State> {
    let mut state = M::INITIAL;
    let mut error: Option<StepError> = None;
    let mut visited = vec![state];
    let mut cleaned_up = false;

    while state != M::EXIT {
        debug!(state = ?state, "Entering state");
        if state == M::CLEANUP {
            cleaned_up = true;
        }

        let next = match machine.step(state, error.as_ref()) {
            Ok(next) if is_permitted(machine, state, next) => Ok(next),
            Ok(next) => Err(StepError::new(
                "transition",
                format!("{:?} -> {:?} is not a permitted transition", state, next),
            )),
            Err(e) => Err(e),
        };

        state = match next {
            Ok(next) => next,
            Err(e) => {
                trace!(state = ?state, error = %e, "Step failed");
                error.get_or_insert(e);
                failure_target::<M>(state, cleaned_up)
            }
        };
        if state == M::CLEANUP && cleaned_up {
            state = M::EXIT;
        }
        visited.push(state);
    }

    Outcome { error, visited }
}

fn is_permitted<M: Machine>(machine: &M, from: M::State, to: M::State) -> bool {
    machine
        .transitions()
        .iter()
        .any(|t| t.from == from && t.to == to)
}

fn failure_target<M: Machine>(state: M::State, cleaned_up: bool) -> M::State {
    if state == M::CLEANUP || cleaned_up {
        M::EXIT
    } else if state == M::ERROR {
        M::CLEANUP
    } else {
        M::ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Toy {
        Start,
        Middle,
        Finish,
        Error,
        Cleanup,
        Exit,
    }

    const TOY_TRANSITIONS: &[Transition<Toy>] = &[
        Transition::new(Toy::Start, Toy::Middle),
        Transition::new(Toy::Middle, Toy::Finish),
        Transition::new(Toy::Finish, Toy::Cleanup),
        Transition::new(Toy::Error, Toy::Cleanup),
        Transition::new(Toy::Cleanup, Toy::Exit),
    ];

    #[derive(Default)]
    struct ToyMachine {
        fail_in: Option<Toy>,
        jump_to: Option<(Toy, Toy)>,
        cleanups: u32,
        seen_error: Option<StepError>,
    }

    impl Machine for ToyMachine {
        type State = Toy;
        const INITIAL: Toy = Toy::Start;
        const ERROR: Toy = Toy::Error;
        const CLEANUP: Toy = Toy::Cleanup;
        const EXIT: Toy = Toy::Exit;

        fn transitions(&self) -> &'static [Transition<Toy>] {
            TOY_TRANSITIONS
        }

        fn step(&mut self, state: Toy, error: Option<&StepError>) -> Result<Toy, StepError> {
            if self.fail_in == Some(state) {
                return Err(StepError::new("toy", format!("{:?} broke", state)));
            }
            if let Some((from, to)) = self.jump_to
                && from == state
            {
                return Ok(to);
            }
            match state {
                Toy::Start => Ok(Toy::Middle),
                Toy::Middle => Ok(Toy::Finish),
                Toy::Finish => Ok(Toy::Cleanup),
                Toy::Error => {
                    self.seen_error = error.cloned();
                    Ok(Toy::Cleanup)
                }
                Toy::Cleanup => {
                    self.cleanups += 1;
                    Ok(Toy::Exit)
                }
                Toy::Exit => unreachable!("exit step is never run"),
            }
        }
    }

    #[test]
    fn test_happy_path() {
        let mut m = ToyMachine::default();
        let outcome = run(&mut m);
        assert!(outcome.is_success());
        assert_eq!(
            outcome.visited,
            vec![Toy::Start, Toy::Middle, Toy::Finish, Toy::Cleanup, Toy::Exit]
        );
        assert_eq!(m.cleanups, 1);
    }

    #[test]
    fn test_failure_routes_through_error_and_cleanup() {
        let mut m = ToyMachine {
            fail_in: Some(Toy::Middle),
            ..Default::default()
        };
        let outcome = run(&mut m);
        assert_eq!(
            outcome.visited,
            vec![Toy::Start, Toy::Middle, Toy::Error, Toy::Cleanup, Toy::Exit]
        );
        let error = outcome.error.unwrap();
        assert_eq!(error.step, "toy");
        assert_eq!(error.message, "Middle broke");
        assert!(error.location.file().ends_with("fsm.rs"));
        assert_eq!(m.seen_error, Some(error));
        assert_eq!(m.cleanups, 1);
    }

    #[test]
    fn test_failing_error_state_still_cleans_up() {
        let mut m = ToyMachine {
            fail_in: Some(Toy::Error),
            jump_to: Some((Toy::Start, Toy::Error)),
            ..Default::default()
        };
        // Start -> Error is not in the table, so Start fails first.
        let outcome = run(&mut m);
        assert_eq!(
            outcome.visited,
            vec![Toy::Start, Toy::Error, Toy::Cleanup, Toy::Exit]
        );
        assert_eq!(outcome.error.unwrap().step, "transition");
        assert_eq!(m.cleanups, 1);
    }

    #[test]
    fn test_failing_cleanup_exits() {
        let mut m = ToyMachine {
            fail_in: Some(Toy::Cleanup),
            ..Default::default()
        };
        let outcome = run(&mut m);
        assert_eq!(outcome.visited.last(), Some(&Toy::Exit));
        assert_eq!(outcome.error.unwrap().message, "Cleanup broke");
    }

    #[test]
    fn test_cleanup_runs_once() {
        let mut m = ToyMachine {
            jump_to: Some((Toy::Cleanup, Toy::Cleanup)),
            ..Default::default()
        };
        // Cleanup -> Cleanup is rejected; the failure goes straight to exit.
        let outcome = run(&mut m);
        assert_eq!(m.cleanups, 0);
        assert_eq!(
            outcome.visited.iter().filter(|s| **s == Toy::Cleanup).count(),
            1
        );
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_step_error_display() {
        let e = StepError::new("bind", "address in use");
        let text = e.to_string();
        assert!(text.starts_with("bind failed: address in use ("));
        assert!(text.contains("fsm.rs:"));
    }
}
