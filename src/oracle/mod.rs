//! Reasoning oracle: structured request in, text and usage counters out.
//!
//! The oracle is always fallible. Callers in the orchestration layer turn
//! failures into human-input requests instead of propagating them.

mod claude;
pub mod prompts;
mod scripted;

pub use claude::{ClaudeOracle, DEFAULT_TIMEOUT_SECS};
pub use scripted::{Reply, ScriptedOracle};

use crate::core::AgentKind;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Why the oracle is being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OraclePurpose {
    Decompose,
    Execute(AgentKind),
    Synthesize,
    AnalyzeFailure,
}

impl OraclePurpose {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decompose => "decompose",
            Self::Execute(_) => "execute",
            Self::Synthesize => "synthesize",
            Self::AnalyzeFailure => "analyze_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub purpose: OraclePurpose,
    /// Role instructions.
    pub system: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OracleResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn invoke(&self, request: &OracleRequest) -> Result<OracleResponse>;
}
