//! Host callback interface
//!
//! The engine never owns a UI; everything user-facing is pulled through
//! [`HostCallbacks`], invoked from the worker thread. Most methods are
//! defaulted no-ops so a minimal embedding only supplies `script_error`.
//!
//! Dialogs and rich-text mutation are synchronous from the script's point of
//! view: the worker issues a [`HostRequest`] and parks until the host calls
//! `Engine::complete_request` with the matching [`HostReply`]. A host that
//! can answer immediately returns [`DialogOutcome::Completed`] instead and
//! no parking happens.

use std::time::Duration;

use super::handles::HandleId;
use crate::lang::interp::PutMode;
use crate::lang::{ScriptError, Variant};

/// What a synchronous request asks of the host.
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Modal choice dialog; reply with the chosen button text.
    AnswerChoice {
        /// Prompt text.
        message: String,
        /// Up to three button labels; empty means a lone OK.
        buttons: Vec<String>,
    },
    /// File-picker dialog; reply with the chosen path or empty.
    AnswerFile {
        /// Prompt text.
        prompt: String,
    },
    /// Folder-picker dialog; reply with the chosen path or empty.
    AnswerFolder {
        /// Prompt text.
        prompt: String,
    },
    /// Text-entry dialog; reply with the entered text.
    AskText {
        /// Prompt text.
        message: String,
        /// Pre-filled answer.
        default: String,
        /// Obscure the entry field.
        password: bool,
    },
    /// Mutate host-owned rich text. The host must serialize these; the
    /// engine issues at most one at a time per worker.
    MutateText {
        /// Object owning the text.
        target: HandleId,
        /// Splice mode.
        mode: PutMode,
        /// Replacement or inserted text.
        text: String,
    },
}

/// A synchronous request issued by the worker.
#[derive(Debug, Clone)]
pub struct HostRequest {
    /// Matches the reply to the outstanding request.
    pub id: u64,
    /// Payload.
    pub kind: RequestKind,
}

/// Completion of a [`HostRequest`].
#[derive(Debug, Clone)]
pub struct HostReply {
    /// Id of the request being completed.
    pub id: u64,
    /// Result value (button text, entered text, path, or empty).
    pub value: Variant,
}

/// How the host handled a synchronous request.
#[derive(Debug)]
pub enum DialogOutcome {
    /// Answered inline; the worker continues immediately.
    Completed(Variant),
    /// The host will reply later through `Engine::complete_request`; the
    /// worker parks, servicing only terminate and debug introspection.
    Pending,
}

/// Engine-to-host callback surface. Invoked from the worker thread; the
/// implementation must be safe to call from there.
#[allow(unused_variables)]
pub trait HostCallbacks: Send + Sync {
    /// Unrecoverable internal failure; the host should shut the engine down.
    fn fatal_error(&self, message: &str) {}

    /// An event arrived with no live target document.
    fn no_open_document(&self) {}

    /// A script error was raised and is now pending acknowledgement. The
    /// only required method: silently dropped errors make scripts
    /// undebuggable.
    fn script_error(&self, error: &ScriptError);

    /// A `put` with no destination; the host shows it in its message box.
    fn message_result(&self, value: &str) {}

    /// Capture the screen before a visual effect.
    fn screen_save(&self) {}

    /// Release a captured screen.
    fn screen_release(&self) {}

    /// Render a named visual effect.
    fn visual_effect(&self, name: &str) {}

    /// Repaint the current view.
    fn view_refresh(&self) {}

    /// Layout mutation is about to happen.
    fn layout_will_change(&self) {}

    /// Layout mutation finished.
    fn layout_did_change(&self) {}

    /// The `beep` command.
    fn beep(&self, count: i64) {}

    /// The host's find facility.
    fn find(&self, text: &str) {}

    /// A synchronous request (dialog or text mutation). Return
    /// [`DialogOutcome::Pending`] to answer later via
    /// `Engine::complete_request`.
    fn request(&self, request: HostRequest) -> DialogOutcome {
        // Headless default: dialogs resolve to their neutral answer.
        match request.kind {
            RequestKind::AnswerChoice { buttons, .. } => DialogOutcome::Completed(Variant::Str(
                buttons.into_iter().next().unwrap_or_else(|| "OK".into()),
            )),
            RequestKind::AskText { default, .. } => {
                DialogOutcome::Completed(Variant::Str(default))
            }
            RequestKind::AnswerFile { .. }
            | RequestKind::AnswerFolder { .. }
            | RequestKind::MutateText { .. } => DialogOutcome::Completed(Variant::empty()),
        }
    }

    /// Localized display name for a terminology class.
    fn class_display_name(&self, class: &str) -> String {
        class.to_string()
    }

    /// Show or hide the host's busy/status indicator.
    fn auto_status_visible(&self, visible: bool) {}

    /// Debugger console output.
    fn debug_message(&self, text: &str) {}

    /// True while the host wants checkpoint pauses honored.
    fn is_debugging(&self) -> bool {
        false
    }

    /// The paused snapshot changed (after a variable mutation).
    fn debug_vars_changed(&self) {}

    /// The script asked for a different idle cadence.
    fn adjust_timer_interval(&self, interval: Duration) {}
}

/// Headless host: logs script errors and answers every dialog with its
/// neutral default. Used by tests and the CLI.
#[derive(Debug, Default)]
pub struct NullHost;

impl HostCallbacks for NullHost {
    fn script_error(&self, error: &ScriptError) {
        tracing::warn!(line = error.line, "script error: {}", error.rendered());
    }
}
