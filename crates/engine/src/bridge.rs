use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Tool names selected per bridge agent, keyed by agent id.
pub type ToolSelections = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSelection {
    pub agent_id: String,
    pub tool_names: Vec<String>,
}

/// Bridge routing fields attached to an outbound message. Absent keys are not serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeFieldSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_agent_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_tool_selections: Option<Vec<ToolSelection>>,
}

impl BridgeFieldSet {
    pub fn is_empty(&self) -> bool {
        self.bridge_agent_ids.is_none() && self.bridge_tool_selections.is_none()
    }
}

/// Overlays conversation tool selections on the session defaults.
///
/// A conversation entry replaces the agent's default tool list; an empty list removes the
/// agent entirely. When no agent keeps a tool, the plain conversation agent list is used.
pub fn merge_bridge_fields(
    conversation_agent_ids: &[String],
    conversation_tools: &ToolSelections,
    default_tools: &ToolSelections,
) -> BridgeFieldSet {
    let mut merged = default_tools.clone();
    for (agent_id, tool_names) in conversation_tools {
        if tool_names.is_empty() {
            merged.remove(agent_id);
        } else {
            merged.insert(agent_id.clone(), tool_names.clone());
        }
    }
    merged.retain(|_, tool_names| !tool_names.is_empty());

    if !merged.is_empty() {
        let agent_ids = merged.keys().cloned().collect();
        let selections = merged
            .into_iter()
            .map(|(agent_id, tool_names)| ToolSelection {
                agent_id,
                tool_names,
            })
            .collect();
        return BridgeFieldSet {
            bridge_agent_ids: Some(agent_ids),
            bridge_tool_selections: Some(selections),
        };
    }

    if !conversation_agent_ids.is_empty() {
        return BridgeFieldSet {
            bridge_agent_ids: Some(conversation_agent_ids.to_vec()),
            bridge_tool_selections: None,
        };
    }

    BridgeFieldSet::default()
}

/// Drops every agent reference the catalogue does not know.
///
/// An unknown (`None`) or empty catalogue drops the whole field set: stale agent ids are a
/// local-state bug and must never reach the backend.
pub fn sanitize_bridge_fields(
    fields: BridgeFieldSet,
    available_agent_ids: Option<&HashSet<String>>,
) -> BridgeFieldSet {
    if fields.is_empty() {
        return fields;
    }

    let Some(available) = available_agent_ids.filter(|available| !available.is_empty()) else {
        tracing::warn!("agent catalogue unknown or empty; dropping bridge fields");
        return BridgeFieldSet::default();
    };

    let agent_ids = fields.bridge_agent_ids.map(|agent_ids| {
        agent_ids
            .into_iter()
            .filter(|agent_id| available.contains(agent_id))
            .collect::<Vec<_>>()
    });
    let selections = fields.bridge_tool_selections.map(|selections| {
        selections
            .into_iter()
            .filter(|selection| available.contains(&selection.agent_id))
            .collect::<Vec<_>>()
    });

    let sanitized = BridgeFieldSet {
        bridge_agent_ids: agent_ids.filter(|agent_ids| !agent_ids.is_empty()),
        bridge_tool_selections: selections.filter(|selections| !selections.is_empty()),
    };
    if sanitized.is_empty() {
        tracing::warn!("every bridge agent in the request is unavailable; sending none");
    }
    sanitized
}
