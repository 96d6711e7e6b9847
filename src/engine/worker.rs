//! Per-document execution worker
//!
//! One dedicated OS thread runs all script code for a document; the host/UI
//! thread never executes scripts. Cross-thread traffic arrives on an mpsc
//! command channel, plus a mutex/condvar gate shared with the poster side
//! for the bounded event queue and acquisition flags.
//!
//! Priorities when work competes: terminate > host reply > debug controls >
//! document acquisition > queued events. While the worker is parked inside a
//! synchronous host call it services terminate and debug traffic only; new
//! events stay queued. The auto-release pool drains after every processed
//! event, the worker's quiescent point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::debug::{DebugControl, DebugState, Stepper, VarSnapshot};
use super::handles::{HandleId, HandleRef, HandleRegistry};
use super::host::{DialogOutcome, HostCallbacks, HostReply, HostRequest, RequestKind};
use super::queue::EventQueue;
use crate::lang::interp::{Halt, Interp, InterpHooks, InterpResult, PutMode, StepInfo};
use crate::lang::{ScriptError, Variant};

/// How long the idle worker sleeps between channel polls.
const IDLE_POLL: Duration = Duration::from_millis(25);

/// Commands on the UI-to-worker channel.
pub(crate) enum Command {
    /// Wake after a gate mutation (event posted, document released).
    Wake,
    /// One-shot message-box evaluation.
    Evaluate {
        /// Source text.
        src: String,
        /// Dispatch target for messages the text sends.
        target: Option<HandleRef>,
        /// Completion channel.
        reply: Sender<Result<Variant, ScriptError>>,
    },
    /// Replace the checkpoint line set.
    SetCheckpoints(Vec<u32>),
    /// Debugger control.
    Debug(DebugControl),
    /// Mutate a variable in the paused (or next-stepped) frame.
    SetVariable {
        /// Variable name.
        name: String,
        /// New value, stored as a string.
        value: String,
    },
    /// Completion of an outstanding synchronous host request.
    HostReply(HostReply),
    /// Exit the worker, abandoning all pending work.
    Terminate,
}

/// State shared between the engine facade and the worker.
pub(crate) struct Shared {
    pub gate: Mutex<Gate>,
    pub wake: Condvar,
}

/// Fields behind the shared gate.
pub(crate) struct Gate {
    pub queue: EventQueue,
    pub terminated: bool,
    pub acquire_waiting: bool,
    pub acquired: bool,
    pub debug_state: DebugState,
    pub snapshot: Option<VarSnapshot>,
}

impl Shared {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Mutex::new(Gate {
                queue: EventQueue::new(queue_capacity),
                terminated: false,
                acquire_waiting: false,
                acquired: false,
                debug_state: DebugState::Running,
                snapshot: None,
            }),
            wake: Condvar::new(),
        })
    }
}

/// Spawn the worker thread.
pub(crate) fn spawn(
    interp: Interp,
    registry: Arc<HandleRegistry>,
    host: Arc<dyn HostCallbacks>,
    shared: Arc<Shared>,
    rx: Receiver<Command>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("cardtalk-worker".into())
        .spawn(move || {
            let mut worker = Worker {
                interp,
                hooks: WorkerHooks {
                    shared: Arc::clone(&shared),
                    host,
                    registry,
                    rx,
                    pending: VecDeque::new(),
                    stepper: Stepper::new(),
                    pending_sets: Vec::new(),
                    next_request: 1,
                    terminating: false,
                    abort_requested: false,
                },
            };
            worker.run();
            let mut gate = shared.gate.lock();
            gate.terminated = true;
            shared.wake.notify_all();
            debug!("worker exited");
        })
        .unwrap_or_else(|err| panic!("failed to spawn worker thread: {err}"))
}

struct Worker {
    interp: Interp,
    hooks: WorkerHooks,
}

impl Worker {
    fn run(&mut self) {
        loop {
            self.hooks.drain_channel();
            if self.hooks.terminating || self.hooks.shared.gate.lock().terminated {
                return;
            }

            while let Some(command) = self.hooks.pending.pop_front() {
                self.handle_command(command);
                if self.hooks.terminating {
                    return;
                }
            }

            // Acquisition: grant only when idle with an empty queue, and
            // hand out no events while the host holds the document.
            {
                let mut gate = self.hooks.shared.gate.lock();
                if gate.acquire_waiting && gate.queue.is_empty() {
                    gate.acquire_waiting = false;
                    gate.acquired = true;
                    self.hooks.shared.wake.notify_all();
                    debug!("document acquired by host");
                }
                if gate.acquired {
                    drop(gate);
                    self.hooks.poll_channel(IDLE_POLL);
                    continue;
                }
            }

            let event = self.hooks.shared.gate.lock().queue.pop();
            match event {
                Some(event) => {
                    trace!(event = %event.describe(), "processing");
                    self.process_event(event);
                    // Quiescent point.
                    self.hooks.registry.drain_autorelease();
                }
                None => self.hooks.poll_channel(IDLE_POLL),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Wake => {}
            Command::SetCheckpoints(lines) => self.interp.set_checkpoints(lines),
            Command::Evaluate { src, target, reply } => {
                let result = self
                    .interp
                    .evaluate(&mut self.hooks, target.as_ref(), &src)
                    .map_err(halt_to_error);
                self.finish_message();
                let _ = reply.send(result);
            }
            Command::Debug(control) => self.hooks.control_while_running(control),
            Command::SetVariable { name, value } => {
                self.hooks.pending_sets.push((name, value));
            }
            Command::HostReply(reply) => {
                warn!(id = reply.id, "host reply with no outstanding request");
            }
            Command::Terminate => self.hooks.terminating = true,
        }
    }

    fn process_event(&mut self, event: super::queue::SystemEvent) {
        let target = match &event.target {
            Some(target) if target.is_valid() => Some(target.clone()),
            _ => {
                self.hooks.host.no_open_document();
                return;
            }
        };
        let args = event.param.into_iter().collect();
        let message = event.message.to_lowercase();
        let outcome =
            self.interp
                .send_message(&mut self.hooks, target.as_ref(), &message, args);
        match outcome {
            Ok(handled) => {
                trace!(message = %message, handled, "event done");
            }
            Err(Halt::Abort) => {
                debug!(message = %message, "aborted");
                let mut gate = self.hooks.shared.gate.lock();
                gate.queue.clear();
                gate.debug_state = DebugState::Running;
            }
            Err(Halt::Error(error)) => {
                let mut gate = self.hooks.shared.gate.lock();
                gate.queue.set_error_pending();
                drop(gate);
                self.hooks.host.script_error(&error);
                if self.hooks.host.is_debugging() {
                    self.hooks.pause_at_error();
                }
            }
        }
        self.finish_message();
    }

    /// Message boundary: stepping state never leaks into the next message.
    fn finish_message(&mut self) {
        self.hooks.stepper.reset();
        self.hooks.abort_requested = false;
        let mut gate = self.hooks.shared.gate.lock();
        if gate.debug_state != DebugState::PausedAtError {
            gate.debug_state = DebugState::Running;
        }
    }
}

struct WorkerHooks {
    shared: Arc<Shared>,
    host: Arc<dyn HostCallbacks>,
    registry: Arc<HandleRegistry>,
    rx: Receiver<Command>,
    pending: VecDeque<Command>,
    stepper: Stepper,
    pending_sets: Vec<(String, String)>,
    next_request: u64,
    terminating: bool,
    abort_requested: bool,
}

impl WorkerHooks {
    /// Pull everything waiting on the channel. Commands the interpreter can
    /// act on mid-run are applied; the rest buffer for the main loop.
    fn drain_channel(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.absorb(command, usize::MAX);
        }
    }

    /// Blocking pull with a timeout, for the idle loop.
    fn poll_channel(&mut self, timeout: Duration) {
        match self.rx.recv_timeout(timeout) {
            Ok(command) => self.absorb(command, usize::MAX),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.terminating = true,
        }
    }

    fn absorb(&mut self, command: Command, depth: usize) {
        match command {
            Command::Terminate => self.terminating = true,
            Command::Debug(DebugControl::Abort) => self.abort_requested = true,
            Command::Debug(control) => {
                // A step control issued while running arms a pause at the
                // next statement.
                self.stepper.resume(control, depth);
            }
            Command::SetVariable { name, value } => {
                self.pending_sets.push((name, value));
            }
            Command::HostReply(reply) => {
                warn!(id = reply.id, "host reply with no outstanding request");
            }
            other => self.pending.push_back(other),
        }
    }

    fn control_while_running(&mut self, control: DebugControl) {
        if control == DebugControl::Abort {
            self.abort_requested = true;
        } else {
            self.stepper.resume(control, usize::MAX);
        }
    }

    fn publish_snapshot(&self, info: &StepInfo<'_>, state: DebugState) {
        let snapshot = VarSnapshot {
            handler: info.handler.to_string(),
            line: info.line,
            depth: info.depth,
            locals: info
                .locals
                .iter()
                .map(|(name, value)| (name.clone(), value.to_string()))
                .collect(),
            globals: info
                .globals
                .iter()
                .map(|(name, value)| (name.clone(), value.to_string()))
                .collect(),
        };
        let mut gate = self.shared.gate.lock();
        gate.snapshot = Some(snapshot);
        gate.debug_state = state;
    }

    fn apply_pending_sets(&mut self, info: &mut StepInfo<'_>) {
        if self.pending_sets.is_empty() {
            return;
        }
        for (name, value) in self.pending_sets.drain(..) {
            let value = Variant::Str(value);
            if info.locals.contains_key(&name) {
                info.locals.insert(name, value);
            } else {
                info.globals.insert(name, value);
            }
        }
        self.host.debug_vars_changed();
    }

    /// Park at a checkpoint until a control arrives.
    fn pause(&mut self, info: &mut StepInfo<'_>) -> InterpResult<()> {
        self.publish_snapshot(info, DebugState::PausedAtCheckpoint);
        self.host
            .debug_message(&format!("paused at line {} in {}", info.line, info.handler));
        loop {
            let command = match self.rx.recv() {
                Ok(command) => command,
                Err(_) => return Err(Halt::Abort),
            };
            match command {
                Command::Terminate => {
                    self.terminating = true;
                    return Err(Halt::Abort);
                }
                Command::Debug(DebugControl::Abort) => {
                    self.shared.gate.lock().debug_state = DebugState::Aborted;
                    return Err(Halt::Abort);
                }
                Command::Debug(control) => {
                    self.stepper.resume(control, info.depth);
                    self.shared.gate.lock().debug_state = DebugState::Running;
                    return Ok(());
                }
                Command::SetVariable { name, value } => {
                    self.pending_sets.push((name, value));
                    self.apply_pending_sets(info);
                    self.publish_snapshot(info, DebugState::PausedAtCheckpoint);
                }
                Command::HostReply(reply) => {
                    warn!(id = reply.id, "host reply with no outstanding request");
                }
                other => self.pending.push_back(other),
            }
        }
    }

    /// Park after a reported error until any control arrives.
    fn pause_at_error(&mut self) {
        self.shared.gate.lock().debug_state = DebugState::PausedAtError;
        loop {
            let command = match self.rx.recv() {
                Ok(command) => command,
                Err(_) => {
                    self.terminating = true;
                    return;
                }
            };
            match command {
                Command::Terminate => {
                    self.terminating = true;
                    return;
                }
                Command::Debug(DebugControl::Abort) => {
                    let mut gate = self.shared.gate.lock();
                    gate.queue.clear();
                    gate.debug_state = DebugState::Running;
                    return;
                }
                Command::Debug(_) => {
                    self.shared.gate.lock().debug_state = DebugState::Running;
                    return;
                }
                other => self.absorb(other, usize::MAX),
            }
        }
    }

    /// Issue a synchronous host request and park for its reply. Only
    /// terminate, abort, and stale-reply traffic is serviced while parked;
    /// everything else buffers.
    fn sync_request(&mut self, kind: RequestKind) -> InterpResult<Variant> {
        let id = self.next_request;
        self.next_request += 1;
        match self.host.request(HostRequest { id, kind }) {
            DialogOutcome::Completed(value) => Ok(value),
            DialogOutcome::Pending => loop {
                let command = match self.rx.recv() {
                    Ok(command) => command,
                    Err(_) => return Err(Halt::Abort),
                };
                match command {
                    Command::Terminate => {
                        self.terminating = true;
                        return Err(Halt::Abort);
                    }
                    Command::Debug(DebugControl::Abort) => return Err(Halt::Abort),
                    Command::HostReply(reply) if reply.id == id => return Ok(reply.value),
                    Command::HostReply(reply) => {
                        warn!(id = reply.id, expected = id, "mismatched host reply dropped");
                    }
                    other => self.pending.push_back(other),
                }
            },
        }
    }
}

impl InterpHooks for WorkerHooks {
    fn step(&mut self, info: &mut StepInfo<'_>) -> InterpResult<()> {
        self.drain_channel();
        if self.terminating || self.abort_requested {
            return Err(Halt::Abort);
        }
        self.apply_pending_sets(info);
        let debugging = self.host.is_debugging();
        if self
            .stepper
            .should_pause(info.depth, info.checkpoint, debugging)
        {
            self.pause(info)?;
        }
        Ok(())
    }

    fn beep(&mut self, count: i64) {
        self.host.beep(count);
    }

    fn wait_tick(&mut self, duration: Duration) -> InterpResult<()> {
        self.drain_channel();
        if self.terminating || self.abort_requested {
            return Err(Halt::Abort);
        }
        std::thread::sleep(duration);
        Ok(())
    }

    fn answer_choice(&mut self, message: String, buttons: Vec<String>) -> InterpResult<Variant> {
        self.sync_request(RequestKind::AnswerChoice { message, buttons })
    }

    fn ask_text(
        &mut self,
        message: String,
        default: String,
        password: bool,
    ) -> InterpResult<Variant> {
        self.sync_request(RequestKind::AskText {
            message,
            default,
            password,
        })
    }

    fn message_result(&mut self, value: &Variant) {
        self.host.message_result(&value.to_string());
    }

    fn mutate_text(&mut self, target: HandleId, mode: PutMode, text: String) -> InterpResult<bool> {
        self.sync_request(RequestKind::MutateText { target, mode, text })?;
        Ok(true)
    }
}

fn halt_to_error(halt: Halt) -> ScriptError {
    match halt {
        Halt::Error(error) => error,
        Halt::Abort => ScriptError::runtime("Execution aborted.", 0),
    }
}
