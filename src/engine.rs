//! Execution engine: owns the runtime and processes commands one at a time.
//!
//! The engine runs on a dedicated OS thread. Runtime initialization happens
//! on that thread before the command loop starts, so commands sent before
//! readiness are delayed in delivery order, never dropped. Evaluations are
//! strictly serialized: the next `Evaluate` does not start until the
//! current one — including its input round-trips — has posted its terminal
//! event.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::interrupt::InterruptFlag;
use crate::protocol::{Command, ContextBundle, Event, ExecutionId};
use crate::runtime::{RuntimeIo, ScriptRuntime};

/// How often the input wait loop re-checks the interrupt flag.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Spawn the engine thread.
///
/// `factory` builds the one runtime instance on the new thread. If it
/// fails, the engine rejects every queued and future command instead of
/// hanging.
pub(crate) fn spawn<R, F>(
    factory: F,
    commands: Receiver<Command>,
    events: UnboundedSender<Event>,
) -> std::thread::JoinHandle<()>
where
    R: ScriptRuntime,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    std::thread::spawn(move || {
        let runtime = match factory() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!("engine initialization failed: {err}");
                reject_all(&commands, &events, &err);
                return;
            }
        };
        debug!("engine runtime ready");
        Engine {
            runtime,
            commands,
            events,
            deferred: VecDeque::new(),
            interrupt: None,
        }
        .run();
    })
}

/// Rejection loop used after an initialization fault: evaluations get a
/// terminal error, everything else a diagnostic, so no caller hangs.
fn reject_all(commands: &Receiver<Command>, events: &UnboundedSender<Event>, err: &Error) {
    while let Ok(cmd) = commands.recv() {
        match cmd {
            Command::Evaluate { id, .. } => {
                let _ = events.send(Event::Error {
                    id,
                    message: format!("engine unavailable: {err}"),
                    interrupted: false,
                });
            }
            Command::Shutdown => break,
            _ => {
                let _ = events.send(Event::Diagnostic {
                    message: format!("engine unavailable: {err}"),
                });
            }
        }
    }
}

struct Engine<R: ScriptRuntime> {
    runtime: R,
    commands: Receiver<Command>,
    events: UnboundedSender<Event>,
    /// Commands that arrived while an evaluation was suspended on input;
    /// drained in arrival order before blocking on the channel again.
    deferred: VecDeque<Command>,
    /// Currently wired interrupt flag.
    interrupt: Option<InterruptFlag>,
}

impl<R: ScriptRuntime> Engine<R> {
    fn run(mut self) {
        loop {
            let cmd = match self.deferred.pop_front() {
                Some(cmd) => cmd,
                None => match self.commands.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                },
            };
            match cmd {
                Command::Evaluate { id, script, context } => self.evaluate(id, &script, &context),
                Command::SetInterruptFlag { flag } => {
                    debug!("interrupt flag wired");
                    self.interrupt = Some(flag);
                }
                Command::InstallFiles { url } => self.install_files(&url),
                Command::InputResponse { id, .. } => {
                    debug!(%id, "dropping input response for finished execution");
                }
                Command::Shutdown => break,
            }
        }
        debug!("engine shut down");
    }

    /// Run one script and post exactly one terminal event, whatever happens.
    fn evaluate(&mut self, id: ExecutionId, script: &str, context: &ContextBundle) {
        debug!(%id, "evaluating script");
        if let Err(err) = self.runtime.resolve_imports(script) {
            // Not fatal: the run itself reports the real error if the
            // script needed the missing module.
            warn!(%id, "import resolution failed: {err}");
        }

        let runtime = &mut self.runtime;
        let mut io = EngineIo {
            id,
            events: &self.events,
            commands: &self.commands,
            deferred: &mut self.deferred,
            interrupt: &mut self.interrupt,
        };
        let outcome = catch_unwind(AssertUnwindSafe(move || {
            runtime.run_script(script, context, &mut io)
        }));

        let event = match outcome {
            Ok(Ok(value)) => Event::Value { id, value },
            Ok(Err(err)) => Event::Error {
                id,
                interrupted: err.is_interrupted(),
                message: err.to_string(),
            },
            Err(panic) => Event::Error {
                id,
                interrupted: false,
                message: panic_message(panic),
            },
        };
        let _ = self.events.send(event);
    }

    fn install_files(&mut self, url: &str) {
        debug!(url, "installing files");
        let result = fetch_archive(url)
            .and_then(|(filename, bytes)| self.runtime.unpack_archive(&filename, &bytes));
        if let Err(err) = result {
            warn!(url, "file installation failed: {err}");
            let _ = self.events.send(Event::Diagnostic {
                message: format!("failed to install files from {url}: {err}"),
            });
        }
    }
}

/// Fetch an archive over HTTP. The engine thread is a plain OS thread, so
/// blocking IO is fine here.
fn fetch_archive(url: &str) -> Result<(String, Vec<u8>)> {
    let response = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .map_err(|err| Error::Install(err.to_string()))?;
    let bytes = response
        .bytes()
        .map_err(|err| Error::Install(err.to_string()))?;
    let filename = url.rsplit('/').next().unwrap_or_default().to_string();
    Ok((filename, bytes.to_vec()))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("runtime panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("runtime panicked: {message}")
    } else {
        "runtime panicked".to_string()
    }
}

/// Output redirection and stdin plumbing scoped to one evaluation.
///
/// Every write is tagged with the owning id. The input wait keeps
/// servicing `SetInterruptFlag` and honors the interrupt flag; all other
/// commands are deferred until this evaluation has posted its terminal
/// event.
struct EngineIo<'a> {
    id: ExecutionId,
    events: &'a UnboundedSender<Event>,
    commands: &'a Receiver<Command>,
    deferred: &'a mut VecDeque<Command>,
    interrupt: &'a mut Option<InterruptFlag>,
}

impl RuntimeIo for EngineIo<'_> {
    fn write_output(&mut self, text: &str) {
        let _ = self.events.send(Event::Output {
            id: self.id,
            text: text.to_string(),
        });
    }

    fn read_input(&mut self, prompt: &str) -> Result<String> {
        let _ = self.events.send(Event::InputRequest {
            id: self.id,
            prompt: prompt.to_string(),
        });
        loop {
            self.check_interrupt()?;
            match self.commands.recv_timeout(INPUT_POLL_INTERVAL) {
                Ok(Command::InputResponse { id, text }) if id == self.id => return Ok(text),
                Ok(Command::InputResponse { id, .. }) => {
                    debug!(%id, "dropping input response for finished execution");
                }
                Ok(Command::SetInterruptFlag { flag }) => *self.interrupt = Some(flag),
                Ok(Command::Shutdown) => {
                    self.deferred.push_back(Command::Shutdown);
                    return Err(Error::Bridge("engine is shutting down".to_string()));
                }
                Ok(cmd) => self.deferred.push_back(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Bridge(
                        "coordinator closed the command channel".to_string(),
                    ));
                }
            }
        }
    }

    fn check_interrupt(&self) -> Result<()> {
        match self.interrupt.as_ref() {
            Some(flag) => flag.check(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{self, Sender};
    use serde_json::Value;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use uuid::Uuid;

    /// Echoes the script back as one output chunk and as the result value,
    /// checking the interrupt flag first.
    struct EchoRuntime;

    impl ScriptRuntime for EchoRuntime {
        fn run_script(
            &mut self,
            script: &str,
            _context: &ContextBundle,
            io: &mut dyn RuntimeIo,
        ) -> Result<Option<Value>> {
            io.check_interrupt()?;
            io.write_output(script);
            Ok(Some(Value::String(script.to_string())))
        }

        fn unpack_archive(&mut self, _filename: &str, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn start() -> (Sender<Command>, UnboundedReceiver<Event>) {
        let (cmd_tx, cmd_rx) = channel::unbounded();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        spawn(|| Ok(EchoRuntime), cmd_rx, evt_tx);
        (cmd_tx, evt_rx)
    }

    fn evaluate(id: ExecutionId, script: &str) -> Command {
        Command::Evaluate {
            id,
            script: script.to_string(),
            context: ContextBundle::new(),
        }
    }

    #[test]
    fn evaluation_streams_output_then_terminal_value() {
        let (cmd_tx, mut evt_rx) = start();
        let id = Uuid::new_v4();
        cmd_tx.send(evaluate(id, "hello")).unwrap();

        match evt_rx.blocking_recv().unwrap() {
            Event::Output { id: got, text } => {
                assert_eq!(got, id);
                assert_eq!(text, "hello");
            }
            other => panic!("expected output, got {other:?}"),
        }
        match evt_rx.blocking_recv().unwrap() {
            Event::Value { id: got, value } => {
                assert_eq!(got, id);
                assert_eq!(value, Some(Value::String("hello".to_string())));
            }
            other => panic!("expected value, got {other:?}"),
        }
    }

    #[test]
    fn evaluations_are_processed_in_submission_order() {
        let (cmd_tx, mut evt_rx) = start();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        cmd_tx.send(evaluate(first, "one")).unwrap();
        cmd_tx.send(evaluate(second, "two")).unwrap();

        let ids: Vec<ExecutionId> = (0..4)
            .map(|_| match evt_rx.blocking_recv().unwrap() {
                Event::Output { id, .. } | Event::Value { id, .. } => id,
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![first, first, second, second]);
    }

    #[test]
    fn raised_flag_fails_evaluation_as_interrupted() {
        let (cmd_tx, mut evt_rx) = start();
        let flag = InterruptFlag::new();
        flag.raise();
        cmd_tx.send(Command::SetInterruptFlag { flag }).unwrap();

        let id = Uuid::new_v4();
        cmd_tx.send(evaluate(id, "hello")).unwrap();
        match evt_rx.blocking_recv().unwrap() {
            Event::Error { id: got, interrupted, .. } => {
                assert_eq!(got, id);
                assert!(interrupted);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn rewiring_the_flag_is_idempotent() {
        let (cmd_tx, mut evt_rx) = start();
        let flag = InterruptFlag::new();
        cmd_tx
            .send(Command::SetInterruptFlag { flag: flag.clone() })
            .unwrap();
        cmd_tx.send(Command::SetInterruptFlag { flag }).unwrap();

        let id = Uuid::new_v4();
        cmd_tx.send(evaluate(id, "still works")).unwrap();
        assert!(matches!(
            evt_rx.blocking_recv().unwrap(),
            Event::Output { .. }
        ));
    }

    #[test]
    fn stale_input_response_is_dropped() {
        let (cmd_tx, mut evt_rx) = start();
        cmd_tx
            .send(Command::InputResponse {
                id: Uuid::new_v4(),
                text: "late".to_string(),
            })
            .unwrap();

        let id = Uuid::new_v4();
        cmd_tx.send(evaluate(id, "after stale response")).unwrap();
        match evt_rx.blocking_recv().unwrap() {
            Event::Output { id: got, .. } => assert_eq!(got, id),
            other => panic!("expected output, got {other:?}"),
        }
    }

    #[test]
    fn init_failure_rejects_queued_evaluations() {
        let (cmd_tx, cmd_rx) = channel::unbounded();
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        // Commands queued before the factory runs must still be answered.
        let id = Uuid::new_v4();
        cmd_tx.send(evaluate(id, "never runs")).unwrap();
        cmd_tx
            .send(Command::InstallFiles {
                url: "http://example.invalid/files.zip".to_string(),
            })
            .unwrap();
        spawn(
            || Err::<EchoRuntime, _>(Error::Init("no runtime".to_string())),
            cmd_rx,
            evt_tx,
        );

        match evt_rx.blocking_recv().unwrap() {
            Event::Error { id: got, message, interrupted } => {
                assert_eq!(got, id);
                assert!(!interrupted);
                assert!(message.contains("engine unavailable"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(
            evt_rx.blocking_recv().unwrap(),
            Event::Diagnostic { .. }
        ));
    }
}
