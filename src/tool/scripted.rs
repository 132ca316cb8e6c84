use crate::error::Result;
use crate::tool::{ToolCommand, ToolOutput, ToolRunner};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Handler = Box<dyn FnMut(&ToolCommand) -> ToolOutput + Send>;

/// A runner that never spawns anything, used for testing.
///
/// Each program answers from its queue of scripted outputs first, then from
/// its handler, and otherwise succeeds with empty output. Every command is
/// recorded in the order it was run.
#[derive(Default)]
pub struct ScriptedRunner {
    queued: Mutex<HashMap<String, VecDeque<ToolOutput>>>,
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<ToolCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-shot output for the next run of `program`.
    pub fn respond(&self, program: &str, output: ToolOutput) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(program.to_owned())
            .or_default()
            .push_back(output);
        self
    }

    /// Installs a handler answering every run of `program` that has no
    /// queued output left.
    pub fn handle(
        &self,
        program: &str,
        handler: impl FnMut(&ToolCommand) -> ToolOutput + Send + 'static,
    ) -> &Self {
        self.handlers
            .lock()
            .unwrap()
            .insert(program.to_owned(), Box::new(handler));
        self
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded commands rendered as command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    /// Index of the first recorded command line starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.command_lines()
            .iter()
            .position(|line| line.starts_with(prefix))
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(command.clone());

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(command.program())
            .and_then(VecDeque::pop_front);
        if let Some(output) = queued {
            return Ok(output);
        }

        match self.handlers.lock().unwrap().get_mut(command.program()) {
            Some(handler) => Ok(handler(command)),
            None => Ok(ToolOutput::success("")),
        }
    }
}
