// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles shared by the downstream crates

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{CommandOutput, CommandRunner, DiskError, render_command};

type Handler = dyn Fn(&str, &[&str]) -> CommandOutput + Send + Sync;

/// Command runner answering from a closure and recording every call
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    handler: Box<Handler>,
}

impl ScriptedRunner {
    pub fn new(handler: impl Fn(&str, &[&str]) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    /// Runner on which every command succeeds with empty output
    pub fn succeeding() -> Self {
        Self::new(|_, _| CommandOutput::ok(""))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(' ').next() == Some(program))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DiskError> {
        self.calls
            .lock()
            .unwrap()
            .push(render_command(program, args));
        Ok((self.handler)(program, args))
    }
}
