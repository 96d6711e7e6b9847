//! CardTalk CLI - Command-line runner for CardTalk scripts
//!
//! Provides subcommands for running a script file's handlers, evaluating a
//! one-shot expression, and syntax-checking a script.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cardtalk::engine::{
    DocumentId, Engine, EngineConfig, HandleDesc, HandleKind, HostCallbacks, SystemEvent,
};
use cardtalk::lang::dict::ClassDef;
use cardtalk::lang::handler::Script;
use cardtalk::lang::interp::register_builtins;
use cardtalk::lang::{Dictionary, ParseLimits, ScriptError};

#[derive(Parser)]
#[command(name = "cardtalk")]
#[command(about = "Embeddable English-like scripting engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file by dispatching a message to it
    Run {
        /// Script file (handlers in `on … end` form)
        file: PathBuf,

        /// Message to dispatch
        #[arg(short, long, default_value = "startup")]
        message: String,
    },

    /// Evaluate a one-shot expression or statement line
    Eval {
        /// Expression text, e.g. '3 + 4 * 2'
        expr: String,
    },

    /// Parse a script file and report syntax errors
    Check {
        /// Script file
        file: PathBuf,
    },
}

/// Host that prints engine output to the terminal.
struct StdioHost;

impl HostCallbacks for StdioHost {
    fn script_error(&self, error: &ScriptError) {
        if error.line != 0 {
            eprintln!("error (line {}): {}", error.line, error.rendered());
        } else {
            eprintln!("error: {}", error.rendered());
        }
    }

    fn message_result(&self, value: &str) {
        println!("{}", value);
    }

    fn beep(&self, count: i64) {
        for _ in 0..count.max(1) {
            eprintln!("beep");
        }
    }

    fn debug_message(&self, text: &str) {
        eprintln!("[debug] {}", text);
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, message } => {
            let src = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;

            let engine = Engine::new(EngineConfig::default(), Arc::new(StdioHost))?;
            let source = Arc::new(src);
            let script = Arc::clone(&source);
            engine.register_class(
                ClassDef::new("script").with_script(Arc::new(move |_| Some((*script).clone()))),
            )?;

            let registry = Arc::clone(engine.registry());
            let document = DocumentId::new();
            let session = registry.begin_session(document);
            let target = registry.create(HandleDesc {
                kind: HandleKind::Document,
                class: "script".into(),
                document,
                session,
                layer: 0,
                widget: 0,
            });

            engine.post_event(SystemEvent::user(message, Some(target)))?;
            // Acquisition is only granted once the queue is empty and the
            // worker is idle, which doubles as a completion barrier.
            engine.try_acquire(Duration::from_secs(30), Duration::from_millis(10))?;
            engine.release_document();
        }

        Commands::Eval { expr } => {
            let engine = Engine::new(EngineConfig::default(), Arc::new(StdioHost))?;
            let value = engine.evaluate(&expr, None)?;
            println!("{}", value);
        }

        Commands::Check { file } => {
            let src = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let limits = ParseLimits::default();
            let mut dict = Dictionary::new();
            register_builtins(&mut dict)?;

            let script = match Script::split(&src, &limits) {
                Ok(script) => script,
                Err(err) => {
                    eprintln!("{}: {}", file.display(), err);
                    std::process::exit(1);
                }
            };
            let mut failed = false;
            for slot in script.handlers() {
                if let Err(err) = slot.handler(&dict, &limits, &[]) {
                    eprintln!("{}: {}", file.display(), err);
                    failed = true;
                }
            }
            if failed {
                std::process::exit(1);
            }
            println!(
                "{}: ok ({} handlers)",
                file.display(),
                script.handlers().len()
            );
        }
    }

    Ok(())
}
