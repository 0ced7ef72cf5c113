//! Scripted [`Shell`] for driving the pipeline without git or make.

use anyhow::Result;
use std::cell::RefCell;

use crate::process::{Cmd, CmdOutput, Shell};

type Matcher = Box<dyn Fn(&Cmd) -> bool>;
type Responder = Box<dyn Fn(&Cmd) -> CmdOutput>;

/// Records every command and answers with the first matching rule.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub(crate) struct ScriptedShell {
    rules: Vec<(Matcher, Responder)>,
    calls: RefCell<Vec<Cmd>>,
}

impl ScriptedShell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(
        mut self,
        matcher: impl Fn(&Cmd) -> bool + 'static,
        responder: impl Fn(&Cmd) -> CmdOutput + 'static,
    ) -> Self {
        self.rules.push((Box::new(matcher), Box::new(responder)));
        self
    }

    pub(crate) fn calls(&self) -> Vec<Cmd> {
        self.calls.borrow().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Cmd) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }
}

impl Shell for ScriptedShell {
    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput> {
        self.calls.borrow_mut().push(cmd.clone());
        let output = self
            .rules
            .iter()
            .find(|(matcher, _)| matcher(cmd))
            .map(|(_, responder)| responder(cmd))
            .unwrap_or_else(|| CmdOutput::ok(""));
        Ok(output)
    }
}

/// `make` invocation carrying `target` as an argument.
pub(crate) fn is_make(cmd: &Cmd, target: &str) -> bool {
    cmd.program() == "make" && cmd.has_arg(target)
}

