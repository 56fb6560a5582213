use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::adb::runner::CommandExecutor;
use crate::app::config::KitConfig;
use crate::app::context::ToolContext;
use crate::app::models::CommandResult;

struct Rule {
    pattern: String,
    responses: VecDeque<Option<CommandResult>>,
}

/// Canned-output executor. The longest registered pattern contained in the command line wins;
/// queued responses are consumed in order and the last one repeats. Unmatched commands yield an
/// empty successful result.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

pub(crate) fn ok(text: &str) -> Option<CommandResult> {
    Some(CommandResult {
        text: text.to_string(),
        succeeded: true,
        timed_out: false,
    })
}

pub(crate) fn failed(text: &str) -> Option<CommandResult> {
    Some(CommandResult {
        text: text.to_string(),
        succeeded: false,
        timed_out: false,
    })
}

pub(crate) fn timed_out(command: &str) -> Option<CommandResult> {
    Some(CommandResult::timed_out(command, 1))
}

impl ScriptedExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, pattern: &str, text: &str) -> &Self {
        self.on_sequence(pattern, vec![ok(text)])
    }

    pub(crate) fn on_sequence(&self, pattern: &str, responses: Vec<Option<CommandResult>>) -> &Self {
        let mut rules = self.rules.lock().expect("rules lock");
        rules.retain(|rule| rule.pattern != pattern);
        rules.push(Rule {
            pattern: pattern.to_string(),
            responses: responses.into(),
        });
        drop(rules);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn count(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(&self, command_line: &str, _timeout: Duration) -> Option<CommandResult> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(command_line.to_string());
        let mut rules = self.rules.lock().expect("rules lock");
        let rule = rules
            .iter_mut()
            .filter(|rule| command_line.contains(&rule.pattern))
            .max_by_key(|rule| rule.pattern.len());
        match rule {
            Some(rule) if rule.responses.len() > 1 => rule.responses.pop_front().flatten(),
            Some(rule) => rule.responses.front().cloned().flatten(),
            None => ok(""),
        }
    }
}

pub(crate) fn context_with(executor: Arc<ScriptedExecutor>) -> Arc<ToolContext> {
    context_with_config(executor, KitConfig::default())
}

pub(crate) fn context_with_config(
    executor: Arc<ScriptedExecutor>,
    config: KitConfig,
) -> Arc<ToolContext> {
    Arc::new(ToolContext::with_adb_program(config, executor, "adb"))
}
