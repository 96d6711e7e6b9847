//! Execution and debugging control plane
//!
//! One [`Engine`] instance drives one open document: it owns the handle
//! registry the host and scripts share, a bounded system-event queue, and a
//! dedicated worker thread that parses and interprets scripts. All
//! user-facing effects go back through [`HostCallbacks`].
//!
//! Lifecycle: create the engine, register terminology (classes, properties,
//! elements, constants, functions, commands, synonyms), then start posting
//! events or evaluations; the worker spawns lazily on the first of those and
//! terminology is frozen from then on. Dropping the engine terminates the
//! worker.

use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod debug;
pub mod error;
pub mod handles;
pub mod host;
pub mod queue;
mod worker;

pub use debug::{DebugControl, DebugState, VarSnapshot};
pub use error::{EngineError, HandleError, QueueError, Result};
pub use handles::{DocumentId, HandleDesc, HandleId, HandleKind, HandleRef, HandleRegistry};
pub use host::{DialogOutcome, HostCallbacks, HostReply, HostRequest, NullHost, RequestKind};
pub use queue::{DEFAULT_QUEUE_CAPACITY, EventKind, EventQueue, SystemEvent};

use crate::lang::dict::{ClassDef, Dictionary, ElementDef, FunctionDef, PropGetter, PropSetter};
use crate::lang::grammar::{CommandDef, CommandExec};
use crate::lang::interp::{Interp, register_builtins};
use crate::lang::{ParseLimits, ScriptError, Variant};
use worker::{Command, Shared};

/// Engine configuration. Serializable so hosts can persist it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the bounded system-event queue.
    pub event_queue_capacity: usize,
    /// Lexer and parser limits.
    pub limits: ParseLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            limits: ParseLimits::default(),
        }
    }
}

/// One scripting engine bound to one document.
pub struct Engine {
    config: EngineConfig,
    host: Arc<dyn HostCallbacks>,
    registry: Arc<HandleRegistry>,
    shared: Arc<Shared>,
    /// `Some` during the setup phase; moved into the worker at start.
    setup: Mutex<Option<Dictionary>>,
    tx: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine with the built-in terminology registered.
    pub fn new(config: EngineConfig, host: Arc<dyn HostCallbacks>) -> Result<Self> {
        let mut dict = Dictionary::new();
        register_builtins(&mut dict)?;
        Ok(Self {
            shared: Shared::new(config.event_queue_capacity),
            config,
            host,
            registry: HandleRegistry::new(),
            setup: Mutex::new(Some(dict)),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// The handle registry shared with the host.
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    // ----- terminology registration (setup phase only) -------------------

    fn with_dict<T>(&self, f: impl FnOnce(&mut Dictionary) -> Result<T>) -> Result<T> {
        let mut setup = self.setup.lock();
        match setup.as_mut() {
            Some(dict) => f(dict),
            None => Err(EngineError::Terminology(
                "terminology registration after engine start".into(),
            )),
        }
    }

    /// Register an object class.
    pub fn register_class(&self, class: ClassDef) -> Result<()> {
        self.with_dict(|dict| dict.register_class(class))
    }

    /// Register a global (engine-level) property.
    pub fn register_global_property(
        &self,
        name: &str,
        getter: Option<PropGetter>,
        setter: Option<PropSetter>,
    ) -> Result<()> {
        self.with_dict(|dict| {
            dict.register_global_property(name, getter, setter);
            Ok(())
        })
    }

    /// Register an element (collection) vocabulary entry.
    pub fn register_element(&self, element: ElementDef) -> Result<()> {
        self.with_dict(|dict| dict.register_element(element))
    }

    /// Register a named constant.
    pub fn register_constant(&self, name: &str, value: Variant) -> Result<()> {
        self.with_dict(|dict| {
            dict.register_constant(name, value);
            Ok(())
        })
    }

    /// Register a host function.
    pub fn register_function(&self, function: FunctionDef) -> Result<()> {
        self.with_dict(|dict| {
            dict.register_function(function);
            Ok(())
        })
    }

    /// Register a word-sequence synonym.
    pub fn register_synonym(&self, from: &str, to: &str) -> Result<()> {
        self.with_dict(|dict| {
            dict.register_synonym(from, to);
            Ok(())
        })
    }

    /// Compile and register a host command grammar.
    pub fn register_command(
        &self,
        grammar: &str,
        param_names: &[&str],
        exec: CommandExec,
    ) -> Result<Arc<CommandDef>> {
        self.with_dict(|dict| dict.register_command(grammar, param_names, exec))
    }

    // ----- worker lifecycle -----------------------------------------------

    fn ensure_started(&self) -> Result<()> {
        let mut tx = self.tx.lock();
        if tx.is_some() {
            return Ok(());
        }
        let dict = self
            .setup
            .lock()
            .take()
            .ok_or_else(|| EngineError::WorkerGone("engine already terminated".into()))?;
        let interp = Interp::new(Arc::new(dict), self.config.limits.clone());
        let (sender, receiver) = mpsc::channel();
        let handle = worker::spawn(
            interp,
            Arc::clone(&self.registry),
            Arc::clone(&self.host),
            Arc::clone(&self.shared),
            receiver,
        );
        *self.worker.lock() = Some(handle);
        *tx = Some(sender);
        debug!("worker started");
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        let tx = self.tx.lock();
        let sender = tx
            .as_ref()
            .ok_or_else(|| EngineError::WorkerGone("worker not started".into()))?;
        sender
            .send(command)
            .map_err(|_| EngineError::WorkerGone("worker exited".into()))
    }

    /// Terminate the worker, abandoning pending work. Idempotent; also runs
    /// on drop.
    pub fn terminate(&self) {
        {
            let mut gate = self.shared.gate.lock();
            gate.terminated = true;
            self.shared.wake.notify_all();
        }
        let _ = self.send(Command::Terminate);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    // ----- event and evaluation traffic ----------------------------------

    /// Post a system event. Fails immediately when the queue is full, an
    /// error is pending acknowledgement (idle events), or the engine has
    /// terminated; it never blocks.
    pub fn post_event(&self, event: SystemEvent) -> Result<()> {
        self.ensure_started()?;
        {
            let mut gate = self.shared.gate.lock();
            if gate.terminated {
                return Err(QueueError::Terminated.into());
            }
            gate.queue.post(event)?;
        }
        self.send(Command::Wake)
    }

    /// One-shot message-box evaluation: a lone expression yields its value,
    /// anything else runs as statements and yields `the result`. Blocks the
    /// calling thread until the worker finishes it.
    pub fn evaluate(&self, src: &str, target: Option<&HandleRef>) -> Result<Variant> {
        self.ensure_started()?;
        let (reply, receiver) = mpsc::channel::<std::result::Result<Variant, ScriptError>>();
        self.send(Command::Evaluate {
            src: src.to_string(),
            target: target.cloned(),
            reply,
        })?;
        match receiver.recv() {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::WorkerGone("worker exited".into())),
        }
    }

    /// Host acknowledged the posted script error; idle events flow again.
    pub fn acknowledge_error(&self) {
        self.shared.gate.lock().queue.acknowledge_error();
    }

    /// Complete an outstanding synchronous host request.
    pub fn complete_request(&self, reply: HostReply) -> Result<()> {
        self.send(Command::HostReply(reply))
    }

    // ----- debugging ------------------------------------------------------

    /// Replace the checkpoint (breakpoint) line set; clears the parsed
    /// script cache so statements are re-stamped.
    pub fn set_checkpoints(&self, lines: Vec<u32>) -> Result<()> {
        self.ensure_started()?;
        self.send(Command::SetCheckpoints(lines))
    }

    /// Issue a debug control. Abort is legal in any state and always wins.
    pub fn debug_control(&self, control: DebugControl) -> Result<()> {
        self.ensure_started()?;
        self.send(Command::Debug(control))
    }

    /// Current debug state.
    pub fn debug_state(&self) -> DebugState {
        self.shared.gate.lock().debug_state
    }

    /// Latest published variable snapshot, if the worker has paused.
    pub fn variables(&self) -> Option<VarSnapshot> {
        self.shared.gate.lock().snapshot.clone()
    }

    /// Mutate a variable by name in the paused frame (or the globals).
    pub fn set_variable(&self, name: &str, value: &str) -> Result<()> {
        self.send(Command::SetVariable {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    // ----- document acquisition ------------------------------------------

    /// Request temporary exclusive hold of the document for direct host
    /// mutation. Granted only when the worker is idle with an empty queue;
    /// polls every `retry` until `timeout` elapses.
    pub fn try_acquire(&self, timeout: Duration, retry: Duration) -> Result<()> {
        self.ensure_started()?;
        let deadline = Instant::now() + timeout;
        let mut gate = self.shared.gate.lock();
        gate.acquire_waiting = true;
        drop(gate);
        let _ = self.send(Command::Wake);
        loop {
            let mut gate = self.shared.gate.lock();
            if gate.acquired {
                return Ok(());
            }
            if gate.terminated {
                gate.acquire_waiting = false;
                return Err(EngineError::WorkerGone("worker exited".into()));
            }
            if Instant::now() >= deadline {
                gate.acquire_waiting = false;
                return Err(EngineError::AcquireTimeout);
            }
            self.shared.wake.wait_for(&mut gate, retry);
        }
    }

    /// Release a previously acquired document; the worker resumes events.
    pub fn release_document(&self) {
        {
            let mut gate = self.shared.gate.lock();
            gate.acquired = false;
        }
        let _ = self.send(Command::Wake);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("started", &self.tx.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_refused_after_start() {
        let engine = Engine::new(EngineConfig::default(), Arc::new(NullHost)).unwrap();
        engine.register_constant("answer", Variant::Integer(42)).unwrap();
        let value = engine.evaluate("answer + 0", None).unwrap();
        assert!(matches!(value, Variant::Integer(42)));

        let err = engine
            .register_constant("late", Variant::Integer(1))
            .unwrap_err();
        assert!(matches!(err, EngineError::Terminology(_)));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn terminate_is_idempotent() {
        let engine = Engine::new(EngineConfig::default(), Arc::new(NullHost)).unwrap();
        let _ = engine.evaluate("1 + 1", None).unwrap();
        engine.terminate();
        engine.terminate();
        assert!(matches!(
            engine.evaluate("2 + 2", None),
            Err(EngineError::WorkerGone(_))
        ));
    }
}
