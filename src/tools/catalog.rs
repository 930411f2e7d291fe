//! Tool catalog — the static set of game actions the model may call.
//!
//! Definitions ship inside the binary (`data/gmod_tools.json`) in the
//! OpenAI function-tool format and are sent verbatim with every request.
//! The catalog is read-only after construction.

use indexmap::IndexMap;

use super::errors::ToolError;
use crate::inference::types::ToolDefinition;

/// Built-in definitions, embedded at compile time.
const BUILTIN_TOOLS: &str = include_str!("../../data/gmod_tools.json");

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Immutable registry of tool name → definition, in declaration order.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: IndexMap<String, ToolDefinition>,
}

impl ToolCatalog {
    /// The embedded GMod tool set.
    pub fn builtin() -> Result<Self, ToolError> {
        Self::from_json(BUILTIN_TOOLS)
    }

    /// Load from a JSON array of function-tool definitions.
    pub fn from_json(json: &str) -> Result<Self, ToolError> {
        let defs: Vec<ToolDefinition> =
            serde_json::from_str(json).map_err(|e| ToolError::InvalidCatalog {
                reason: e.to_string(),
            })?;
        Self::from_definitions(defs)
    }

    pub fn from_definitions(defs: Vec<ToolDefinition>) -> Result<Self, ToolError> {
        let mut tools = IndexMap::with_capacity(defs.len());
        for def in defs {
            let name = def.function.name.clone();
            if tools.insert(name.clone(), def).is_some() {
                return Err(ToolError::DuplicateTool { name });
            }
        }
        Ok(Self { tools })
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Definitions in declaration order, ready for a request body.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate a tool call: tool exists and required arguments are present.
    ///
    /// This is a basic structural check; the game-side handler does the real
    /// validation and reports its own errors.
    pub fn validate_arguments(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), ToolError> {
        let def = self.get(tool_name).ok_or_else(|| ToolError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        let Some(required) = def.function.parameters.get("required").and_then(|r| r.as_array())
        else {
            return Ok(());
        };

        let args = arguments.as_object();
        for field_name in required.iter().filter_map(|f| f.as_str()) {
            let present = args.is_some_and(|obj| obj.contains_key(field_name));
            if !present {
                return Err(ToolError::InvalidArguments {
                    tool: tool_name.to_string(),
                    reason: format!("missing required field: '{field_name}'"),
                });
            }
        }

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = ToolCatalog::builtin().unwrap();
        assert!(!catalog.is_empty());
        assert!(catalog.contains("spawn_prop"));
        assert!(catalog.contains("spawn_npc"));
        assert_eq!(catalog.names().next(), Some("spawn_prop"));
        assert_eq!(catalog.definitions().len(), catalog.len());
        assert!(catalog
            .definitions()
            .iter()
            .all(|d| d.r#type == "function"));
    }

    #[test]
    fn test_validate_required_fields() {
        let catalog = ToolCatalog::builtin().unwrap();
        assert!(catalog
            .validate_arguments("spawn_prop", &serde_json::json!({"model": "props_c17/oildrum001.mdl"}))
            .is_ok());

        let err = catalog
            .validate_arguments("spawn_prop", &serde_json::json!({"frozen": true}))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn test_validate_unknown_tool() {
        let catalog = ToolCatalog::builtin().unwrap();
        assert!(matches!(
            catalog.validate_arguments("rm_rf", &serde_json::json!({})),
            Err(ToolError::UnknownTool { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"[
            {"type": "function", "function": {"name": "jump", "parameters": {}}},
            {"type": "function", "function": {"name": "jump", "parameters": {}}}
        ]"#;
        assert!(matches!(
            ToolCatalog::from_json(json),
            Err(ToolError::DuplicateTool { .. })
        ));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            ToolCatalog::from_json("{}"),
            Err(ToolError::InvalidCatalog { .. })
        ));
    }

    #[test]
    fn test_no_required_list_accepts_anything() {
        let json = r#"[{"type": "function", "function": {"name": "get_players", "parameters": {"type": "object", "properties": {}}}}]"#;
        let catalog = ToolCatalog::from_json(json).unwrap();
        assert!(catalog.validate_arguments("get_players", &serde_json::json!(null)).is_ok());
        assert!(catalog.get("get_players").is_some());
    }
}
