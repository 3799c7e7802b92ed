//! Execution bridge between a UI-facing coordinator and an isolated
//! script engine.
//!
//! This crate provides:
//! - [`Coordinator`]: issues execution requests, routes streamed output
//!   and input requests back to their callers, exposes cooperative
//!   interruption and fire-and-forget file installation
//! - [`ScriptRuntime`] / [`RuntimeIo`]: the embedded-runtime abstraction
//!   the engine drives
//! - [`InterruptFlag`]: the shared one-byte cancellation flag
//! - [`protocol`]: the tagged messages crossing the coordinator/engine
//!   boundary
//!
//! The engine runs on a dedicated thread and owns exactly one runtime
//! instance, built lazily on that thread; commands sent before it is ready
//! are delayed, never dropped. Evaluations are strictly serialized —
//! including their input round-trips — so output attribution can never
//! bleed between executions.
//!
//! Cancellation is cooperative: [`Coordinator::interrupt`] raises the
//! shared flag and the runtime observes it at its next checkpoint. A
//! script that never reaches a checkpoint cannot be stopped by the bridge.

pub mod coordinator;
mod engine;
pub mod error;
pub mod interrupt;
pub mod protocol;
pub mod runtime;

pub use coordinator::{
    Coordinator, DiagnosticSink, ExecutionState, InputSource, OutputSink,
};
pub use error::{Error, Result};
pub use interrupt::{INTERRUPT_CLEAR, INTERRUPT_SIGINT, InterruptFlag};
pub use protocol::{Command, ContextBundle, Event, ExecutionId};
pub use runtime::{RuntimeIo, ScriptRuntime};
