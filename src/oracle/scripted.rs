//! Deterministic oracle for tests and dry runs.
//!
//! Replies are scripted per purpose, optionally keyed on a substring of
//! the prompt. A script with several replies hands them out in order and
//! then keeps repeating the last one.

use super::{Oracle, OracleRequest, OracleResponse};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Fail(String),
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn fail(s: impl Into<String>) -> Self {
        Self::Fail(s.into())
    }
}

#[derive(Debug)]
struct Script {
    label: &'static str,
    needle: Option<String>,
    replies: VecDeque<Reply>,
}

impl Script {
    fn matches(&self, request: &OracleRequest) -> bool {
        self.label == request.purpose.label()
            && self
                .needle
                .as_deref()
                .map(|n| request.prompt.contains(n))
                .unwrap_or(true)
    }

    fn next_reply(&mut self) -> Option<Reply> {
        if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedOracle {
    scripts: Mutex<Vec<Script>>,
    calls: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script replies for a purpose label (`decompose`, `execute`,
    /// `synthesize`, `analyze_failure`), optionally only for prompts
    /// containing `needle`. Keyed scripts win over unkeyed ones.
    pub fn script(&self, label: &'static str, needle: Option<&str>, replies: Vec<Reply>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push(Script {
                label,
                needle: needle.map(str::to_string),
                replies: replies.into(),
            });
        }
    }

    pub fn on_decompose(self, needle: &str, text: &str) -> Self {
        self.script("decompose", Some(needle), vec![Reply::text(text)]);
        self
    }

    pub fn on_execute(self, needle: &str, reply: Reply) -> Self {
        self.script("execute", Some(needle), vec![reply]);
        self
    }

    pub fn on_synthesize(self, text: &str) -> Self {
        self.script("synthesize", None, vec![Reply::text(text)]);
        self
    }

    pub fn on_analyze(self, needle: &str, text: &str) -> Self {
        self.script("analyze_failure", Some(needle), vec![Reply::text(text)]);
        self
    }

    /// Every request received so far.
    pub fn calls(&self) -> Vec<OracleRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, label: &str) -> usize {
        self.calls()
            .iter()
            .filter(|r| r.purpose.label() == label)
            .count()
    }

    fn pick(&self, request: &OracleRequest) -> Option<Reply> {
        let mut scripts = self.scripts.lock().ok()?;
        let keyed = scripts
            .iter()
            .position(|s| s.needle.is_some() && s.matches(request));
        let index = keyed.or_else(|| {
            scripts
                .iter()
                .position(|s| s.needle.is_none() && s.matches(request))
        })?;
        scripts[index].next_reply()
    }
}

fn word_count(s: &str) -> u32 {
    u32::try_from(s.split_whitespace().count()).unwrap_or(u32::MAX)
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn invoke(&self, request: &OracleRequest) -> Result<OracleResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }

        let reply = self.pick(request).or_else(|| match request.purpose.label() {
            "execute" => Some(Reply::text("completed")),
            "synthesize" => Some(Reply::text("synthesized summary")),
            _ => None,
        });

        match reply {
            Some(Reply::Text(text)) => Ok(OracleResponse {
                input_tokens: word_count(&request.prompt),
                output_tokens: word_count(&text),
                text,
            }),
            Some(Reply::Fail(message)) => Err(Error::Oracle(message)),
            None => Err(Error::Oracle(format!(
                "no scripted reply for {}",
                request.purpose.label()
            ))),
        }
    }
}
