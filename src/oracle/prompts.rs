//! Oracle request builders.
//!
//! The decomposition prompt asks for the delimited record format the
//! parser reads first; the failure-analysis prompt asks for an
//! `ACTION: <TOKEN>` line.

use super::{OraclePurpose, OracleRequest};
use crate::core::{AgentKind, Task};

const COORDINATOR_SYSTEM: &str = "You are a coordinator. You break work into \
small, well-scoped subtasks and assign each to the right specialist.";

pub fn decomposition(task: &Task, max_subtasks: usize) -> OracleRequest {
    let agents: Vec<&str> = AgentKind::ALL.iter().map(|k| k.as_str()).collect();
    let prompt = format!(
        "Decompose the following task into at most {max} subtasks.\n\n\
         Task: {title}\n\
         Description: {description}\n\n\
         Separate subtasks with a line containing only ---. For each subtask write:\n\
         Title: <short title>\n\
         Description: <what must be produced>\n\
         Priority: high | normal | low\n\
         Agent: one of {agents}\n\
         Dependencies: comma-separated numbers of earlier subtasks, or none\n\
         Complexity: simple | moderate | complex\n\n\
         Mark a subtask complex only if it needs further decomposition.",
        max = max_subtasks,
        title = task.title,
        description = task.description,
        agents = agents.join(", "),
    );
    OracleRequest {
        purpose: OraclePurpose::Decompose,
        system: COORDINATOR_SYSTEM.to_string(),
        prompt,
    }
}

fn role_instructions(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Coordinator => COORDINATOR_SYSTEM,
        AgentKind::Researcher => {
            "You are a researcher. Gather facts and sources and report them concisely."
        }
        AgentKind::Writer => "You are a writer. Produce clear, well-structured prose.",
        AgentKind::Coder => "You are a software engineer. Produce working, tested code.",
        AgentKind::Analyst => {
            "You are an analyst. Examine the material and report findings with evidence."
        }
        AgentKind::Reviewer => {
            "You are a reviewer. Check the material for errors and list concrete fixes."
        }
    }
}

/// Prompt for a worker, carrying the outputs of completed dependencies.
pub fn execution(task: &Task, kind: AgentKind, inputs: &[(String, String)]) -> OracleRequest {
    let mut prompt = format!("Subtask: {}\n\n{}\n", task.title, task.description);
    if !inputs.is_empty() {
        prompt.push_str("\nResults from earlier subtasks:\n");
        for (title, output) in inputs {
            prompt.push_str(&format!("\n## {}\n{}\n", title, output));
        }
    }
    OracleRequest {
        purpose: OraclePurpose::Execute(kind),
        system: role_instructions(kind).to_string(),
        prompt,
    }
}

/// Ask the oracle to merge child results into one result for `task`.
pub fn synthesis(task: &Task, children: &[Task]) -> OracleRequest {
    let mut prompt = format!(
        "Combine the subtask results below into a single result for:\n\
         Task: {}\nDescription: {}\n",
        task.title, task.description
    );
    for child in children {
        prompt.push_str(&format!(
            "\n## {}\n{}\n",
            child.title,
            child.result.as_deref().unwrap_or("(no output)")
        ));
    }
    OracleRequest {
        purpose: OraclePurpose::Synthesize,
        system: COORDINATOR_SYSTEM.to_string(),
        prompt,
    }
}

pub fn failure_analysis(parent: &Task, failed: &Task) -> OracleRequest {
    let prompt = format!(
        "A subtask of \"{parent}\" failed.\n\n\
         Subtask: {title}\n\
         Description: {description}\n\
         Failure: {reason}\n\
         Previous retries: {retries}\n\n\
         Choose one recovery action and answer with a line `ACTION: <TOKEN>`:\n\
         RETRY - run the same subtask again unchanged\n\
         REDEFINE - rewrite the subtask to avoid the failure\n\
         SPLIT - break the subtask into smaller pieces\n\
         HUMAN - ask a human to decide\n\
         SKIP - the subtask is not critical, continue without it\n\
         Then explain your reasoning briefly.",
        parent = parent.title,
        title = failed.title,
        description = failed.description,
        reason = failed
            .metadata
            .failure_reason
            .as_deref()
            .unwrap_or("unknown"),
        retries = failed.metadata.retry_count,
    );
    OracleRequest {
        purpose: OraclePurpose::AnalyzeFailure,
        system: COORDINATOR_SYSTEM.to_string(),
        prompt,
    }
}
