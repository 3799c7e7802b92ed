//! Embedded-runtime abstraction driven by the engine.
//!
//! The engine owns exactly one [`ScriptRuntime`] instance, built by a
//! factory closure on the engine thread, and serializes all calls into it.
//! Implementations wrap whatever language runtime is being embedded; the
//! bridge itself assigns no meaning to scripts or result values.

use serde_json::Value;

use crate::error::Result;
use crate::protocol::ContextBundle;

/// Host facilities handed to the runtime for the duration of one script.
///
/// Output written here is tagged with the owning execution id and streamed
/// to the coordinator. Input requests suspend the script until the
/// coordinator's input handler answers.
pub trait RuntimeIo {
    /// Stream an output chunk to the coordinator.
    fn write_output(&mut self, text: &str);

    /// Request a line of interactive input, blocking until the answer
    /// round-trips through the coordinator. Fails with
    /// [`Error::Interrupted`](crate::Error::Interrupted) if the interrupt
    /// flag is raised while waiting.
    fn read_input(&mut self, prompt: &str) -> Result<String>;

    /// Cooperative cancellation checkpoint. Long-running work should call
    /// this periodically and propagate the error; it fails once the shared
    /// interrupt flag has been raised.
    fn check_interrupt(&self) -> Result<()>;
}

/// The embedded language runtime the engine wraps.
///
/// Created once, lives for the engine's lifetime, never recreated. The
/// engine guarantees `run_script` calls never overlap: a second evaluation
/// waits until the first has produced its terminal event, including any
/// input round-trips.
pub trait ScriptRuntime: Send + 'static {
    /// Best-effort resolution of modules the script imports, before it
    /// runs. A missing module is not fatal here; if the script actually
    /// needs it, the run itself reports the real error.
    fn resolve_imports(&mut self, _script: &str) -> Result<()> {
        Ok(())
    }

    /// Execute `script` with `context` bound into a fresh execution-scoped
    /// namespace. Returns the script's result value, if any.
    ///
    /// Implementations should route prints through `io.write_output`,
    /// reads through `io.read_input`, and call `io.check_interrupt` at
    /// their cooperative checkpoints.
    fn run_script(
        &mut self,
        script: &str,
        context: &ContextBundle,
        io: &mut dyn RuntimeIo,
    ) -> Result<Option<Value>>;

    /// Unpack a fetched archive into the runtime's working filesystem.
    /// `filename` is the last path segment of the source URL, for format
    /// detection.
    fn unpack_archive(&mut self, filename: &str, bytes: &[u8]) -> Result<()>;
}
