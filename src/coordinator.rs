//! Execution coordinator: the UI-facing half of the bridge.
//!
//! Owns per-execution bookkeeping, routes engine events back to the right
//! execution record, and exposes [`Coordinator::run`],
//! [`Coordinator::interrupt`] and [`Coordinator::install_files`] to the
//! surrounding application.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Sender};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::engine;
use crate::error::{Error, Result};
use crate::interrupt::InterruptFlag;
use crate::protocol::{Command, ContextBundle, Event, ExecutionId};
use crate::runtime::ScriptRuntime;

/// Callback receiving incremental output chunks for one execution, in
/// emission order, strictly before its `run` future settles.
pub type OutputSink = Box<dyn FnMut(&str) + Send>;

/// Callback answering interactive input requests. Receives the prompt and
/// resolves to the text fed back to the runtime's input source; the future
/// may take arbitrarily long (e.g. a modal prompt).
pub type InputSource = Box<dyn FnMut(&str) -> BoxFuture<'static, String> + Send>;

/// Callback receiving fire-and-forget diagnostics, such as file
/// installation failures. Diagnostics are additionally logged.
pub type DiagnosticSink = Box<dyn FnMut(&str) + Send>;

/// Lifecycle of one execution, as observed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Submitted, no engine activity observed yet.
    Pending,
    /// The script is running.
    Running,
    /// Suspended on an input request until the answer round-trips.
    AwaitingInput,
    /// Terminal: completed with a value.
    Succeeded,
    /// Terminal: the script raised a fault.
    Failed,
    /// Terminal: cancelled through the interrupt flag.
    Cancelled,
}

/// Bookkeeping for one in-flight execution. Owned exclusively by the
/// coordinator; removed from the registry exactly once, on the terminal
/// event.
struct ExecutionRecord {
    state: ExecutionState,
    output: OutputSink,
    input: InputSource,
    done: oneshot::Sender<Result<Option<Value>>>,
}

type Registry = Arc<Mutex<HashMap<ExecutionId, ExecutionRecord>>>;

/// The UI-facing controller of the execution bridge.
///
/// Spawning a coordinator starts the engine thread (which builds the one
/// runtime instance) and an event-routing task. Dropping it shuts the
/// engine down.
///
/// Evaluations are serialized by the engine: a `run` submitted while
/// another is still in flight queues behind it, including behind its input
/// round-trips.
pub struct Coordinator {
    commands: Sender<Command>,
    registry: Registry,
    interrupt: InterruptFlag,
}

impl Coordinator {
    /// Spawn the engine thread and start routing its events.
    ///
    /// `factory` runs on the engine thread and builds the runtime.
    /// Commands issued before it completes are delayed, not dropped; if it
    /// fails, every queued and future `run` rejects promptly.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, F>(factory: F) -> Self
    where
        R: ScriptRuntime,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        Self::spawn_inner(factory, None)
    }

    /// Like [`Coordinator::spawn`], with a sink receiving fire-and-forget
    /// diagnostics (e.g. `install_files` failures).
    pub fn spawn_with_diagnostics<R, F>(factory: F, diagnostics: DiagnosticSink) -> Self
    where
        R: ScriptRuntime,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        Self::spawn_inner(factory, Some(diagnostics))
    }

    fn spawn_inner<R, F>(factory: F, diagnostics: Option<DiagnosticSink>) -> Self
    where
        R: ScriptRuntime,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let (command_tx, command_rx) = channel::unbounded();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        engine::spawn(factory, command_rx, event_tx);

        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(route_events(
            event_rx,
            Arc::clone(&registry),
            command_tx.clone(),
            diagnostics,
        ));

        // Wire the shared flag before anything can run.
        let interrupt = InterruptFlag::new();
        let _ = command_tx.send(Command::SetInterruptFlag {
            flag: interrupt.clone(),
        });

        Self {
            commands: command_tx,
            registry,
            interrupt,
        }
    }

    /// Run `script`, streaming output chunks to `output` and answering
    /// input requests through `input`.
    ///
    /// Resolves with the script's result value once the engine posts the
    /// terminal event; rejects with [`Error::Script`] on a script fault,
    /// [`Error::Interrupted`] on cancellation, or [`Error::Bridge`] if the
    /// engine goes away. Settles exactly once, and `output` is never
    /// invoked after settlement.
    pub async fn run(
        &self,
        script: impl Into<String>,
        output: OutputSink,
        input: InputSource,
    ) -> Result<Option<Value>> {
        self.run_with_context(script, ContextBundle::new(), output, input)
            .await
    }

    /// Like [`Coordinator::run`], with per-execution bindings injected into
    /// a fresh execution-scoped namespace — never into runtime-wide
    /// globals, so nothing leaks between executions.
    pub async fn run_with_context(
        &self,
        script: impl Into<String>,
        context: ContextBundle,
        output: OutputSink,
        input: InputSource,
    ) -> Result<Option<Value>> {
        // A new execution always starts with a cleared interrupt flag.
        self.interrupt.clear();

        let id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let Ok(mut registry) = self.registry.lock() else {
                return Err(Error::Bridge("execution registry poisoned".to_string()));
            };
            registry.insert(
                id,
                ExecutionRecord {
                    state: ExecutionState::Pending,
                    output,
                    input,
                    done: done_tx,
                },
            );
        }

        debug!(%id, "submitting script");
        let command = Command::Evaluate {
            id,
            script: script.into(),
            context,
        };
        if self.commands.send(command).is_err() {
            // Engine already gone; settle immediately instead of hanging.
            if let Ok(mut registry) = self.registry.lock() {
                registry.remove(&id);
            }
            return Err(Error::Bridge("engine thread is not running".to_string()));
        }

        done_rx
            .await
            .map_err(|_| Error::Bridge("engine terminated before completing the execution".to_string()))?
    }

    /// Request cooperative cancellation of the running execution.
    ///
    /// No-op when nothing is running. Cancellation takes effect at the
    /// runtime's next checkpoint; a script that never reaches one cannot
    /// be stopped this way, only by tearing down the engine thread's
    /// process.
    pub fn interrupt(&self) {
        self.interrupt.raise();
    }

    /// Fire-and-forget provisioning of the runtime's working filesystem
    /// from an archive at `url`.
    ///
    /// Fetch or unpack failures are reported through the diagnostics sink
    /// and the log, never into a pending `run`.
    pub fn install_files(&self, url: impl Into<String>) {
        let url = url.into();
        if self.commands.send(Command::InstallFiles { url }).is_err() {
            warn!("engine thread is not running; dropping install request");
        }
    }

    /// Handle to the shared interrupt flag, e.g. for wiring into UI state.
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Dispatch engine events to their execution records.
///
/// Events for unknown ids are dropped: they legitimately occur after a
/// terminal event already removed the record. Registry removal happens
/// exactly once per id, which also guards against duplicate terminals.
async fn route_events(
    mut events: mpsc::UnboundedReceiver<Event>,
    registry: Registry,
    commands: Sender<Command>,
    mut diagnostics: Option<DiagnosticSink>,
) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Output { id, text } => {
                let Ok(mut registry) = registry.lock() else {
                    continue;
                };
                match registry.get_mut(&id) {
                    Some(record) => {
                        if record.state == ExecutionState::Pending {
                            record.state = ExecutionState::Running;
                        }
                        (record.output)(&text);
                    }
                    None => trace!(%id, "dropping output for unknown execution"),
                }
            }
            Event::InputRequest { id, prompt } => {
                let answer = match registry.lock() {
                    Ok(mut registry) => registry.get_mut(&id).map(|record| {
                        record.state = ExecutionState::AwaitingInput;
                        (record.input)(&prompt)
                    }),
                    Err(_) => None,
                };
                match answer {
                    // Answering happens off the routing loop so a slow
                    // input handler cannot delay terminal events.
                    Some(answer) => {
                        let commands = commands.clone();
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            let text = answer.await;
                            if commands.send(Command::InputResponse { id, text }).is_err() {
                                warn!(%id, "engine gone before input response could be sent");
                            }
                            if let Ok(mut registry) = registry.lock()
                                && let Some(record) = registry.get_mut(&id)
                            {
                                record.state = ExecutionState::Running;
                            }
                        });
                    }
                    None => trace!(%id, "dropping input request for unknown execution"),
                }
            }
            Event::Value { id, value } => {
                let removed = registry.lock().ok().and_then(|mut registry| registry.remove(&id));
                match removed {
                    Some(mut record) => {
                        record.state = ExecutionState::Succeeded;
                        trace!(%id, state = ?record.state, "execution settled");
                        let _ = record.done.send(Ok(value));
                    }
                    None => trace!(%id, "dropping duplicate terminal event"),
                }
            }
            Event::Error { id, message, interrupted } => {
                let removed = registry.lock().ok().and_then(|mut registry| registry.remove(&id));
                match removed {
                    Some(mut record) => {
                        record.state = if interrupted {
                            ExecutionState::Cancelled
                        } else {
                            ExecutionState::Failed
                        };
                        debug!(%id, state = ?record.state, "execution failed: {message}");
                        let error = if interrupted {
                            Error::Interrupted
                        } else {
                            Error::Script(message)
                        };
                        let _ = record.done.send(Err(error));
                    }
                    None => trace!(%id, "dropping duplicate terminal event"),
                }
            }
            Event::Diagnostic { message } => {
                warn!("engine diagnostic: {message}");
                if let Some(sink) = diagnostics.as_mut() {
                    sink(&message);
                }
            }
        }
    }

    // Engine gone: settle anything still in flight instead of hanging.
    if let Ok(mut registry) = registry.lock() {
        for (id, record) in registry.drain() {
            debug!(%id, "engine terminated with execution in flight");
            let _ = record.done.send(Err(Error::Bridge(
                "engine terminated before completing the execution".to_string(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn record(done: oneshot::Sender<Result<Option<Value>>>) -> ExecutionRecord {
        ExecutionRecord {
            state: ExecutionState::Pending,
            output: Box::new(|_| {}),
            input: Box::new(|_| futures::future::pending::<String>().boxed()),
            done,
        }
    }

    #[tokio::test]
    async fn unknown_and_duplicate_events_are_dropped() {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, _command_rx) = channel::unbounded();
        let router = tokio::spawn(route_events(
            event_rx,
            Arc::clone(&registry),
            command_tx,
            None,
        ));

        let id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        registry.lock().unwrap().insert(id, record(done_tx));

        event_tx
            .send(Event::Output {
                id: Uuid::new_v4(),
                text: "stray".to_string(),
            })
            .unwrap();
        event_tx.send(Event::Value { id, value: None }).unwrap();
        // Duplicate terminal for an already-removed id must be ignored.
        event_tx
            .send(Event::Error {
                id,
                message: "late".to_string(),
                interrupted: false,
            })
            .unwrap();

        assert!(matches!(done_rx.await, Ok(Ok(None))));
        drop(event_tx);
        router.await.unwrap();
        assert!(registry.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_loss_settles_in_flight_executions() {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, _command_rx) = channel::unbounded();
        let router = tokio::spawn(route_events(
            event_rx,
            Arc::clone(&registry),
            command_tx,
            None,
        ));

        let (done_tx, done_rx) = oneshot::channel();
        registry.lock().unwrap().insert(Uuid::new_v4(), record(done_tx));

        drop(event_tx);
        router.await.unwrap();
        match done_rx.await {
            Ok(Err(Error::Bridge(_))) => {}
            other => panic!("expected bridge error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn diagnostics_reach_the_sink() {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, _command_rx) = channel::unbounded();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: DiagnosticSink = {
            let seen = Arc::clone(&seen);
            Box::new(move |message: &str| seen.lock().unwrap().push(message.to_string()))
        };
        let router = tokio::spawn(route_events(event_rx, registry, command_tx, Some(sink)));

        event_tx
            .send(Event::Diagnostic {
                message: "fetch failed".to_string(),
            })
            .unwrap();
        drop(event_tx);
        router.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["fetch failed".to_string()]);
    }
}
