//! Messages exchanged between the coordinator and the engine.
//!
//! Commands flow coordinator-to-engine over a blocking channel; events flow
//! back over an async channel. Both directions carry owned values only —
//! the [`InterruptFlag`] handed over by [`Command::SetInterruptFlag`] is
//! the single shared-memory exception.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::interrupt::InterruptFlag;

/// Identifier correlating an execution request with its stream of output,
/// input and terminal events. Unique among in-flight executions.
pub type ExecutionId = Uuid;

/// Per-execution bindings injected into a fresh execution-scoped namespace
/// before the script runs. Never leaks into runtime-wide globals.
pub type ContextBundle = Map<String, Value>;

/// Command sent from the coordinator to the engine.
#[derive(Debug, Clone)]
pub enum Command {
    /// Run a script, streaming output tagged with `id`.
    Evaluate {
        /// Correlation id assigned at submission.
        id: ExecutionId,
        /// Source text to run. Validity is the runtime's concern.
        script: String,
        /// Execution-scoped bindings.
        context: ContextBundle,
    },

    /// Wire the shared interrupt flag into the engine's cooperative
    /// checkpoints. Re-armable: a later command replaces the flag.
    SetInterruptFlag {
        /// The shared flag.
        flag: InterruptFlag,
    },

    /// Provision the runtime's working filesystem from an archive at `url`.
    /// Fire-and-forget: failures become [`Event::Diagnostic`].
    InstallFiles {
        /// Where to fetch the archive from.
        url: String,
    },

    /// Resume an execution suspended on an input request. Responses for an
    /// execution that is not waiting are dropped.
    InputResponse {
        /// Id of the suspended execution.
        id: ExecutionId,
        /// Text fed back to the runtime's input source.
        text: String,
    },

    /// Shut down the engine thread gracefully. The engine also exits when
    /// the command channel disconnects.
    Shutdown,
}

/// Event sent from the engine back to the coordinator.
#[derive(Debug, Clone)]
pub enum Event {
    /// Incremental stdout-equivalent chunk.
    Output {
        /// Owning execution.
        id: ExecutionId,
        /// The chunk, in emission order.
        text: String,
    },

    /// The script requested interactive input; the execution is suspended
    /// until the matching [`Command::InputResponse`] arrives.
    InputRequest {
        /// Suspended execution.
        id: ExecutionId,
        /// Prompt to present to the user.
        prompt: String,
    },

    /// Terminal success.
    Value {
        /// Completed execution.
        id: ExecutionId,
        /// The script's result value, if it produced one.
        value: Option<Value>,
    },

    /// Terminal failure: script fault, cancellation, or a rejected command
    /// after an initialization fault.
    Error {
        /// Failed execution.
        id: ExecutionId,
        /// Human-readable description.
        message: String,
        /// True when the fault was raised by the interrupt flag rather
        /// than by the script itself.
        interrupted: bool,
    },

    /// Fire-and-forget failure report, not tied to any execution
    /// (install faults, commands rejected after an initialization fault).
    Diagnostic {
        /// Human-readable description.
        message: String,
    },
}
