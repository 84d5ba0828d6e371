//! Decomposition parser: oracle free text to subtask records.
//!
//! Two output shapes are understood, tried in order:
//!
//! - [`ParseStrategy::Delimited`]: records separated by `---` lines, each a
//!   list of `Field: value` lines. Text without any separator is read as a
//!   single record.
//! - [`ParseStrategy::NumberedHeadings`]: records introduced by headings
//!   like `1. Title`, `## 2) Title` or `**Subtask 3: Title**`.
//!
//! The first strategy that yields at least one valid record wins. Records
//! missing a title, description or priority are dropped. Dependencies are
//! 1-based positions in the oracle's list and are remapped onto the
//! surviving records; references to dropped, missing or later records are
//! discarded so the result is always acyclic.

use crate::core::{AgentKind, Complexity, Priority};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

/// One parsed subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskRecord {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    /// `None` when the oracle's agent is unknown and nothing could be inferred.
    pub agent: Option<AgentKind>,
    /// 1-based positions of earlier records in the returned list.
    pub dependencies: Vec<usize>,
    pub complexity: Complexity,
}

/// A way of splitting a decomposition reply into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    /// Records separated by `---` lines, or a single record with none.
    Delimited,
    /// Records introduced by `1.`, `2.` style headings.
    NumberedHeadings,
}

impl ParseStrategy {
    /// Tried in this order; the first strategy that yields a record wins.
    pub const ALL: [ParseStrategy; 2] = [ParseStrategy::Delimited, ParseStrategy::NumberedHeadings];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Delimited => "delimited",
            Self::NumberedHeadings => "numbered_headings",
        }
    }

    /// Split text into raw field blocks, in order.
    fn blocks(&self, text: &str) -> Vec<RawBlock> {
        match self {
            Self::Delimited => delimited_blocks(text),
            Self::NumberedHeadings => heading_blocks(text),
        }
    }

    /// Parse with this strategy alone.
    pub fn parse(&self, text: &str) -> Vec<SubtaskRecord> {
        finish(self.blocks(text))
    }
}

/// Parse oracle output, trying each strategy in turn.
///
/// Fails with `DecompositionParse` when no strategy produces a record.
pub fn parse_decomposition(text: &str) -> Result<Vec<SubtaskRecord>> {
    for strategy in ParseStrategy::ALL {
        let records = strategy.parse(text);
        if !records.is_empty() {
            debug!(
                strategy = strategy.name(),
                records = records.len(),
                "Parsed decomposition"
            );
            return Ok(records);
        }
    }
    Err(Error::DecompositionParse(
        "no subtask with title, description and priority found".to_string(),
    ))
}

/// Fields of one record before validation.
#[derive(Debug, Default)]
struct RawBlock {
    heading: Option<String>,
    fields: HashMap<String, String>,
}

/// A line of three or more dashes.
static DELIMITER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*-{3,}\s*$").unwrap());

/// `Field: value`, tolerating bullets and `**bold**` keys.
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]\s+)?(?:\*\*)?([A-Za-z][A-Za-z _]{1,30}?)(?:\*\*)?\s*:(?:\*\*)?\s*(.*)$")
        .unwrap()
});

/// `1. Title`, `## 2) Title`, `**Subtask 3: Title**`.
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:#{1,6}\s*)?(?:\*\*)?(?:(?:subtask|task|step)\s+)?\d+\s*[.):]\s*(.*?)(?:\*\*)?\s*$",
    )
    .unwrap()
});

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Canonical field name, or `None` for fields the parser ignores.
fn canonical_field(key: &str) -> Option<&'static str> {
    let key = key.trim().to_lowercase().replace(['_', '-'], " ");
    match key.as_str() {
        "title" | "name" | "subtask" => Some("title"),
        "description" | "details" | "task description" => Some("description"),
        "priority" => Some("priority"),
        "agent" | "agent type" | "suggested agent" | "assigned agent" => Some("agent"),
        "dependencies" | "depends on" | "dependency" | "deps" => Some("dependencies"),
        "complexity" => Some("complexity"),
        _ => None,
    }
}

/// Collect `Field: value` lines. Lines that are not fields continue the
/// previous field's value.
fn read_fields<'a>(lines: impl Iterator<Item = &'a str>, block: &mut RawBlock) {
    let mut last: Option<&'static str> = None;
    for line in lines {
        if line.trim().is_empty() || DELIMITER_RE.is_match(line) {
            continue;
        }
        let field = FIELD_RE.captures(line).and_then(|caps| {
            let name = canonical_field(caps.get(1)?.as_str())?;
            Some((name, caps.get(2).map(|m| m.as_str()).unwrap_or("")))
        });
        match (field, last) {
            (Some((name, value)), _) => {
                block.fields.insert(name.to_string(), clean(value));
                last = Some(name);
            }
            (None, Some(name)) => {
                if let Some(value) = block.fields.get_mut(name) {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(&clean(line));
                }
            }
            (None, None) => {}
        }
    }
}

fn clean(s: &str) -> String {
    s.trim().trim_matches('*').trim().to_string()
}

fn delimited_blocks(text: &str) -> Vec<RawBlock> {
    let lines: Vec<&str> = text.lines().collect();
    if !lines.iter().any(|l| DELIMITER_RE.is_match(l)) {
        // A single record needs no separator. Numbered lists are left to
        // the heading strategy.
        if lines.iter().any(|l| HEADING_RE.is_match(l)) {
            return Vec::new();
        }
        let mut block = RawBlock::default();
        read_fields(lines.into_iter(), &mut block);
        return if block.fields.is_empty() {
            Vec::new()
        } else {
            vec![block]
        };
    }

    lines
        .split(|l| DELIMITER_RE.is_match(l))
        .map(|chunk| {
            let mut block = RawBlock::default();
            read_fields(chunk.iter().copied(), &mut block);
            block
        })
        .filter(|b| !b.fields.is_empty())
        .collect()
}

fn heading_blocks(text: &str) -> Vec<RawBlock> {
    let mut blocks: Vec<(String, Vec<&str>)> = Vec::new();
    for line in text.lines() {
        let heading = HEADING_RE
            .captures(line)
            .map(|caps| clean(caps.get(1).map(|m| m.as_str()).unwrap_or("")));
        match heading {
            Some(title) => blocks.push((title, Vec::new())),
            None => {
                if let Some((_, body)) = blocks.last_mut() {
                    body.push(line);
                }
            }
        }
    }

    blocks
        .into_iter()
        .map(|(heading, body)| {
            let mut block = RawBlock::default();
            if let Some(inline) = heading.strip_prefix("Title:").map(str::trim) {
                block.fields.insert("title".to_string(), inline.to_string());
            } else if !heading.is_empty() {
                block.heading = Some(heading);
            }
            read_fields(body.into_iter(), &mut block);
            block
        })
        .collect()
}

fn first_word(s: &str) -> &str {
    s.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == '/')
        .find(|w| !w.is_empty())
        .unwrap_or("")
}

/// Validate blocks and remap dependencies onto the surviving records.
fn finish(blocks: Vec<RawBlock>) -> Vec<SubtaskRecord> {
    // original 1-based position -> position in output
    let mut positions: HashMap<usize, usize> = HashMap::new();
    let mut records = Vec::new();

    for (index, block) in blocks.into_iter().enumerate() {
        let original = index + 1;
        let title = block
            .fields
            .get("title")
            .cloned()
            .or(block.heading)
            .filter(|t| !t.is_empty());
        let description = block
            .fields
            .get("description")
            .cloned()
            .filter(|d| !d.is_empty());
        let priority = block
            .fields
            .get("priority")
            .and_then(|p| Priority::parse(first_word(p)));

        let (Some(title), Some(description), Some(priority)) = (title, description, priority)
        else {
            debug!(position = original, "Dropping incomplete subtask record");
            continue;
        };

        let complexity = block
            .fields
            .get("complexity")
            .and_then(|c| Complexity::parse(first_word(c)))
            .unwrap_or_else(|| Complexity::infer(&description));

        let agent = if complexity == Complexity::Complex {
            Some(AgentKind::Coordinator)
        } else {
            block
                .fields
                .get("agent")
                .and_then(|a| AgentKind::parse(a).or_else(|| AgentKind::parse(first_word(a))))
                .or_else(|| AgentKind::infer(&format!("{} {}", title, description)))
        };

        let mut dependencies: Vec<usize> = Vec::new();
        if let Some(raw) = block.fields.get("dependencies") {
            for m in NUMBER_RE.find_iter(raw) {
                let Ok(referenced) = m.as_str().parse::<usize>() else {
                    continue;
                };
                match positions.get(&referenced) {
                    Some(&mapped) if referenced < original => {
                        if !dependencies.contains(&mapped) {
                            dependencies.push(mapped);
                        }
                    }
                    _ => debug!(
                        position = original,
                        referenced, "Discarding dependency on missing or later subtask"
                    ),
                }
            }
        }

        records.push(SubtaskRecord {
            title,
            description,
            priority,
            agent,
            dependencies,
            complexity,
        });
        positions.insert(original, records.len());
    }

    records
}
