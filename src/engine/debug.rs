//! Debug control state machine
//!
//! Replaces hand-checked signal-flag combinations with an explicit state
//! machine: the worker consults it at every statement step, and host-issued
//! controls move it between states. Abort is legal from any state and always
//! wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Externally visible execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugState {
    /// Executing (or idle between events).
    Running,
    /// Stopped on a checkpoint-flagged statement, awaiting a control.
    PausedAtCheckpoint,
    /// Stopped after a reported script error, awaiting a control.
    PausedAtError,
    /// An abort was requested; execution unwinds to the message boundary.
    Aborted,
}

/// Host-issued debug controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugControl {
    /// Resume until the next checkpoint.
    Continue,
    /// Pause at the next statement at or above the current call depth.
    StepOver,
    /// Pause at the very next statement, entering calls.
    StepInto,
    /// Pause at the next statement after the current handler returns.
    StepOut,
    /// Discard pending events and unwind to the message boundary.
    Abort,
}

/// Serializable snapshot of the paused interpreter, for host display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VarSnapshot {
    /// Handler currently executing.
    pub handler: String,
    /// Logical line of the statement about to run.
    pub line: u32,
    /// Call depth (1 = top-level handler).
    pub depth: usize,
    /// Local variables, rendered as strings.
    pub locals: BTreeMap<String, String>,
    /// Global variables, rendered as strings.
    pub globals: BTreeMap<String, String>,
}

/// Where the stepper will pause next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepMode {
    /// Only at checkpoints (while the host reports debugging active).
    Run,
    /// At the next statement with depth at or above the saved frame.
    Over(usize),
    /// At the next statement regardless of depth.
    Into,
    /// At the next statement shallower than the saved frame.
    Out(usize),
}

/// Per-worker stepping state.
#[derive(Debug)]
pub struct Stepper {
    mode: StepMode,
}

impl Stepper {
    /// Start in free-running mode.
    pub fn new() -> Self {
        Self { mode: StepMode::Run }
    }

    /// Decide whether the statement about to run should pause.
    ///
    /// `debugging` gates checkpoint pauses; explicit step modes pause even
    /// when the host is not showing a debugger.
    pub fn should_pause(&self, depth: usize, checkpoint: bool, debugging: bool) -> bool {
        match self.mode {
            StepMode::Run => checkpoint && debugging,
            StepMode::Into => true,
            StepMode::Over(base) => depth <= base,
            StepMode::Out(base) => depth < base,
        }
    }

    /// Apply a resume control issued from a pause at `depth`. Returns false
    /// for [`DebugControl::Abort`], which does not resume.
    pub fn resume(&mut self, control: DebugControl, depth: usize) -> bool {
        self.mode = match control {
            DebugControl::Continue => StepMode::Run,
            DebugControl::StepOver => StepMode::Over(depth),
            DebugControl::StepInto => StepMode::Into,
            DebugControl::StepOut => StepMode::Out(depth),
            DebugControl::Abort => return false,
        };
        true
    }

    /// Drop back to free-running (message finished or aborted).
    pub fn reset(&mut self) {
        self.mode = StepMode::Run;
    }
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_pause_only_while_debugging() {
        let stepper = Stepper::new();
        assert!(stepper.should_pause(1, true, true));
        assert!(!stepper.should_pause(1, true, false));
        assert!(!stepper.should_pause(1, false, true));
    }

    #[test]
    fn step_over_skips_deeper_frames() {
        let mut stepper = Stepper::new();
        assert!(stepper.resume(DebugControl::StepOver, 2));
        assert!(!stepper.should_pause(3, false, true)); // inside a call
        assert!(stepper.should_pause(2, false, true)); // back at our depth
        assert!(stepper.should_pause(1, false, true)); // caller returned early
    }

    #[test]
    fn step_into_pauses_everywhere() {
        let mut stepper = Stepper::new();
        assert!(stepper.resume(DebugControl::StepInto, 1));
        assert!(stepper.should_pause(5, false, false));
    }

    #[test]
    fn step_out_waits_for_the_handler_to_return() {
        let mut stepper = Stepper::new();
        assert!(stepper.resume(DebugControl::StepOut, 2));
        assert!(!stepper.should_pause(2, false, true));
        assert!(stepper.should_pause(1, false, true));
    }

    #[test]
    fn abort_does_not_resume() {
        let mut stepper = Stepper::new();
        assert!(!stepper.resume(DebugControl::Abort, 1));
    }

    #[test]
    fn snapshot_round_trips_through_serde() {
        let mut snapshot = VarSnapshot {
            handler: "mouseup".into(),
            line: 3,
            depth: 1,
            ..VarSnapshot::default()
        };
        snapshot.locals.insert("x".into(), "7".into());
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: VarSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.locals["x"], "7");
        assert_eq!(back.line, 3);
    }
}
