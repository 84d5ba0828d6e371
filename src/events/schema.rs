//! Schema registry: required and optional payload fields per event type.

use crate::events::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::warn;

/// Declared payload fields for one event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

impl EventSchema {
    pub fn new(required: &[&str], optional: &[&str]) -> Self {
        Self {
            required: required.iter().map(|s| s.to_string()).collect(),
            optional: optional.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Event type → schema map.
///
/// Types without a schema are accepted (open world); validation only
/// checks that every required field is present and non-null. Writers only
/// ever insert whole entries, so a poisoned lock still guards a usable map
/// and is recovered rather than dropped.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, EventSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the schema for `event_type`.
    pub fn register_schema(&self, event_type: &str, schema: EventSchema) {
        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type.to_string(), schema);
    }

    pub fn schema_for(&self, event_type: &str) -> Option<EventSchema> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.schema_for(event_type).is_some()
    }

    /// Validate an event's payload.
    ///
    /// Returns one message per missing required field.
    pub fn validate(&self, event: &Event) -> std::result::Result<(), Vec<String>> {
        let Some(schema) = self.schema_for(&event.event_type) else {
            warn!(event_type = %event.event_type, "No schema registered, accepting event");
            return Ok(());
        };

        let missing: Vec<String> = schema
            .required
            .iter()
            .filter(|field| event.field(field).is_none())
            .map(|field| format!("Missing required field: {}", field))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}
