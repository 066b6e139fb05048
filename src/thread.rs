use crate::{CancelToken, ExecError, Executor};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

const WORKER_STACK_SIZE: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure(String),
    Stopped,
}

/// Runs one executor entry point on a dedicated thread.
///
/// The executor moves into the thread and is handed back by `join`.
pub struct Worker {
    handle: Option<JoinHandle<(Executor, RunOutcome)>>,
    cancel: CancelToken,
}

impl Worker {
    pub fn spawn(mut exec: Executor, chunk: &str, label: &str) -> Result<Self, ExecError> {
        let cancel = exec.cancel_token();
        let chunk = chunk.to_string();
        let label = label.to_string();

        let handle = thread::Builder::new()
            .name(format!("irvm-{}", chunk))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let outcome = match exec.run(&chunk, &label) {
                    Ok(()) => RunOutcome::Success,
                    Err(ExecError::Cancelled) => RunOutcome::Stopped,
                    Err(err) => {
                        error!("{}@{} failed: {}", chunk, label, err);
                        RunOutcome::Failure(exec.last_error().to_string())
                    }
                };
                debug!("worker finished with {:?}", outcome);
                (exec, outcome)
            })
            .map_err(|err| ExecError::native(format!("failed to spawn worker: {}", err)))?;

        Ok(Self {
            handle: Some(handle),
            cancel,
        })
    }

    /// Asks the guest to stop at its next call or backward branch.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Returns the result if the thread has finished, `None` while it runs.
    pub fn try_join(&mut self) -> Option<Result<(Executor, RunOutcome), ExecError>> {
        if !self.handle.as_ref()?.is_finished() {
            return None;
        }
        Some(self.join_inner())
    }

    /// Waits for the thread. A stop request is cleared before the executor is
    /// handed back, so it can run again.
    pub fn join(mut self) -> Result<(Executor, RunOutcome), ExecError> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<(Executor, RunOutcome), ExecError> {
        let handle = self.handle.take().ok_or(ExecError::WorkerPanicked)?;
        let joined = handle.join().map_err(|_| ExecError::WorkerPanicked)?;
        self.cancel.reset();
        Ok(joined)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BytecodeBuilder, Function, NativeFn, Opcode};
    use anyhow::Result;
    use std::time::Duration;

    fn spin_chunk() -> Result<crate::Bytecode> {
        let mut builder = BytecodeBuilder::new("main");
        let top = builder.push_label("entry");
        builder.push_op_label(Opcode::Jmp, top)?;
        Ok(builder.build()?)
    }

    #[test]
    fn test_worker_runs_to_completion() -> Result<()> {
        let mut builder = BytecodeBuilder::new("main");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 9)?;
        builder.push_op_func(Opcode::Run, Function::by_hint("square"))?;

        let mut exec = Executor::with_memory(4096)?;
        exec.add_bytecode(builder.build()?);
        let square = NativeFn::new(|exec| {
            let value = exec.pop_int()?;
            exec.push_int(value * value)
        });
        exec.set_resolver(move |_, _| Some(square.clone()));

        let (mut exec, outcome) = Worker::spawn(exec, "main", "entry")?.join()?;
        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(exec.pop_int()?, 81);
        Ok(())
    }

    #[test]
    fn test_worker_reports_failure() -> Result<()> {
        let exec = Executor::with_memory(4096)?;
        let (exec, outcome) = Worker::spawn(exec, "nowhere", "entry")?.join()?;
        assert_eq!(
            outcome,
            RunOutcome::Failure("Bytecode with name \"nowhere\" is not found".to_string())
        );
        assert_eq!(exec.last_error(), "Bytecode with name \"nowhere\" is not found");
        Ok(())
    }

    #[test]
    fn test_worker_stop() -> Result<()> {
        let mut exec = Executor::with_memory(4096)?;
        exec.add_bytecode(spin_chunk()?);

        let mut worker = Worker::spawn(exec, "main", "entry")?;
        std::thread::sleep(Duration::from_millis(20));
        assert!(worker.try_join().is_none());

        worker.stop();
        let (_, outcome) = worker.join()?;
        assert_eq!(outcome, RunOutcome::Stopped);
        Ok(())
    }

    #[test]
    fn test_stopped_executor_runs_again() -> Result<()> {
        let mut exec = Executor::with_memory(4096)?;
        exec.add_bytecode(spin_chunk()?);
        let mut builder = BytecodeBuilder::new("done");
        builder.push_label("entry");
        builder.push_op_int(Opcode::PushI, 3)?;
        exec.add_bytecode(builder.build()?);

        let worker = Worker::spawn(exec, "main", "entry")?;
        worker.stop();
        let (mut exec, outcome) = worker.join()?;
        assert_eq!(outcome, RunOutcome::Stopped);
        assert!(!exec.cancel_token().is_cancelled());

        exec.run("done", "entry")?;
        assert_eq!(exec.pop_int()?, 3);
        Ok(())
    }

    #[test]
    fn test_dropping_a_worker_stops_it() -> Result<()> {
        let mut exec = Executor::with_memory(4096)?;
        exec.add_bytecode(spin_chunk()?);
        let worker = Worker::spawn(exec, "main", "entry")?;
        drop(worker);
        Ok(())
    }
}
