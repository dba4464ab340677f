//! Scripted task bodies.
//!
//! [`ScriptTask`] embeds a [rhai](https://rhai.rs) engine so user-supplied
//! scripts can be scheduled like any other work. Each task owns its engine
//! and variable scope; nothing is shared between concurrently running
//! scripts.

use crate::context::Context;
use crate::task::Work;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Scope};

/// A task body that evaluates an embedded script.
///
/// Parameters seeded with [`ScriptTask::set_param`] are visible to the script
/// as plain variables.
pub struct ScriptTask {
    engine: Engine,
    script: String,
    scope: Mutex<Scope<'static>>,
}

impl ScriptTask {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            engine: Engine::new(),
            script: script.into(),
            scope: Mutex::new(Scope::new()),
        }
    }

    /// Seeds a variable the script can read and write.
    pub fn set_param(&mut self, name: &str, value: impl Into<Dynamic>) {
        self.scope.get_mut().set_value(name.to_string(), value.into());
    }
}

impl Work for ScriptTask {
    fn run(&self, _ctx: &Context) -> Result<()> {
        let mut scope = self.scope.lock();
        self.engine
            .eval_with_scope::<Dynamic>(&mut scope, &self.script)
            .map(|_| ())
            .map_err(|err| anyhow!("script evaluation failed: {err}"))
    }
}
