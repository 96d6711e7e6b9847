//! End-to-end script execution through the engine: posting events, message
//! dispatch through registered classes, coercion rules, and error reporting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use cardtalk::engine::{
    DocumentId, Engine, EngineConfig, EngineError, HandleDesc, HandleKind, HandleRef,
    HostCallbacks, SystemEvent,
};
use cardtalk::lang::dict::ClassDef;
use cardtalk::lang::{ScriptError, Variant};

#[derive(Default)]
struct RecordingHost {
    errors: Mutex<Vec<ScriptError>>,
    results: Mutex<Vec<String>>,
    beeps: Mutex<Vec<i64>>,
    missing_targets: Mutex<usize>,
}

impl HostCallbacks for RecordingHost {
    fn script_error(&self, error: &ScriptError) {
        self.errors.lock().push(error.clone());
    }

    fn message_result(&self, value: &str) {
        self.results.lock().push(value.to_string());
    }

    fn beep(&self, count: i64) {
        self.beeps.lock().push(count);
    }

    fn no_open_document(&self) {
        *self.missing_targets.lock() += 1;
    }
}

struct World {
    engine: Engine,
    host: Arc<RecordingHost>,
    button: HandleRef,
    card: HandleRef,
}

/// A document with one card owning one button, each with a script.
fn world(button_script: &str, card_script: &str) -> World {
    let host = Arc::new(RecordingHost::default());
    let engine = Engine::new(EngineConfig::default(), Arc::clone(&host) as Arc<_>).unwrap();

    let registry = Arc::clone(engine.registry());
    let document = DocumentId::new();
    let session = registry.begin_session(document);
    let card = registry.create(HandleDesc {
        kind: HandleKind::Card,
        class: "card".into(),
        document,
        session,
        layer: 1,
        widget: 0,
    });
    let button = registry.create(HandleDesc {
        kind: HandleKind::Widget,
        class: "button".into(),
        document,
        session,
        layer: 1,
        widget: 1,
    });

    let scripts: Arc<Mutex<HashMap<u64, String>>> = Arc::new(Mutex::new(HashMap::new()));
    scripts.lock().insert(1, button_script.to_string());
    scripts.lock().insert(0, card_script.to_string());

    let lookup = Arc::clone(&scripts);
    let chain_card = card.clone();
    engine
        .register_class(
            ClassDef::new("button")
                .with_script(Arc::new(move |handle| {
                    let widget = handle.desc().ok()?.widget;
                    lookup.lock().get(&widget).cloned()
                }))
                .with_next_responder(Arc::new(move |_| Some(chain_card.clone()))),
        )
        .unwrap();
    let lookup = Arc::clone(&scripts);
    engine
        .register_class(ClassDef::new("card").with_script(Arc::new(move |handle| {
            let widget = handle.desc().ok()?.widget;
            lookup.lock().get(&widget).cloned()
        })))
        .unwrap();

    World {
        engine,
        host,
        button,
        card,
    }
}

impl World {
    /// Post a message at the button and wait for the worker to go idle.
    fn run(&self, message: &str) {
        self.engine
            .post_event(SystemEvent::user(message, Some(self.button.clone())))
            .unwrap();
        self.barrier();
    }

    /// Acquisition is granted only when the worker is idle with an empty
    /// queue, which makes it a completion barrier.
    fn barrier(&self) {
        self.engine
            .try_acquire(Duration::from_secs(10), Duration::from_millis(5))
            .unwrap();
        self.engine.release_document();
    }
}

#[test]
fn put_without_destination_reaches_the_message_box() {
    let world = world("on go\nput 3 + 4\nend go", "");
    world.run("go");
    assert_eq!(*world.host.results.lock(), vec!["7".to_string()]);
}

#[test]
fn command_writes_into_a_variable() {
    let world = world("on go\nput 3 + 4 into x\nput x\nend go", "");
    world.run("go");
    assert_eq!(*world.host.results.lock(), vec!["7".to_string()]);
}

#[test]
fn count_up_loop_beeps_three_times() {
    let world = world("on go\nrepeat with i = 1 to 3\nbeep\nend repeat\nend go", "");
    world.run("go");
    assert_eq!(world.host.beeps.lock().len(), 3);
}

#[test]
fn responder_chain_falls_through_and_pass_continues() {
    let world = world(
        "on go\nput \"button\"\npass go\nend go",
        "on go\nput \"card\"\nend go",
    );
    world.run("go");
    assert_eq!(
        *world.host.results.lock(),
        vec!["button".to_string(), "card".to_string()]
    );
}

#[test]
fn string_arithmetic_follows_the_coercion_rules() {
    let world = world("", "");
    let value = world.engine.evaluate("\"3\" + \"4\"", None).unwrap();
    assert!(matches!(value, Variant::Integer(7)));

    let value = world.engine.evaluate("\"3.0\" + \"4\"", None).unwrap();
    match value {
        Variant::Real(num) => assert_eq!(num, 7.0),
        other => panic!("expected real, got {other:?}"),
    }

    // Division always yields a real.
    let value = world.engine.evaluate("7 / 2", None).unwrap();
    assert!(matches!(value, Variant::Real(_)));
}

#[test]
fn divide_by_zero_reports_and_stays_resumable() {
    let world = world("", "");
    let err = world.engine.evaluate("5 div 0", None).unwrap_err();
    match err {
        EngineError::Script(err) => {
            assert!(err.rendered().contains("divide by zero"));
        }
        other => panic!("unexpected {other:?}"),
    }
    let err = world.engine.evaluate("5 mod 0", None).unwrap_err();
    assert!(matches!(err, EngineError::Script(_)));

    // The engine keeps evaluating after the reported errors.
    let value = world.engine.evaluate("5 div 2", None).unwrap();
    assert!(matches!(value, Variant::Integer(2)));
}

#[test]
fn runtime_error_is_reported_through_the_host() {
    let world = world("on go\nfrobnicate\nend go", "");
    world.run("go");
    let errors = world.host.errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].rendered().contains("frobnicate"));
}

#[test]
fn stale_target_reports_no_open_document() {
    let world = world("on go\nbeep\nend go", "");
    let document = world.button.desc().unwrap().document;
    // A new session strands every handle from the old one.
    world.engine.registry().begin_session(document);
    world.run("go");
    assert_eq!(*world.host.missing_targets.lock(), 1);
    assert!(world.host.beeps.lock().is_empty());
}

#[test]
fn card_handles_what_the_button_ignores() {
    let world = world(
        "on somethingelse\nbeep\nend somethingelse",
        "on go\nput \"handled\"\nend go",
    );
    world.run("go");
    assert_eq!(*world.host.results.lock(), vec!["handled".to_string()]);
    let _ = &world.card;
}

#[test]
fn scripts_load_and_compile_from_disk() {
    use std::io::Write;

    use cardtalk::lang::handler::Script;
    use cardtalk::lang::interp::register_builtins;
    use cardtalk::lang::{Dictionary, ParseLimits};

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "on startup\nput 1 + 1\nend startup\n").unwrap();

    let src = std::fs::read_to_string(file.path()).unwrap();
    let limits = ParseLimits::default();
    let mut dict = Dictionary::new();
    register_builtins(&mut dict).unwrap();

    let script = Script::split(&src, &limits).unwrap();
    assert_eq!(script.handlers().len(), 1);
    for slot in script.handlers() {
        slot.handler(&dict, &limits, &[]).unwrap();
    }
}

#[test]
fn event_parameter_reaches_the_handler() {
    let world = world("on go n\nput n + 1\nend go", "");
    world
        .engine
        .post_event(
            SystemEvent::user("go", Some(world.button.clone())).with_param(Variant::Integer(41)),
        )
        .unwrap();
    world.barrier();
    assert_eq!(*world.host.results.lock(), vec!["42".to_string()]);
}
