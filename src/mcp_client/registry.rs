//! Tool catalog: aggregates tool definitions across all providers.
//!
//! Provides:
//! - Namespacing of provider-local tool names (`provider__tool`)
//! - Schema sanitization for strict function-calling consumers
//! - The routing table from namespaced names back to `(provider, tool)`
//! - Serialization of the catalog into function-calling format

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{json, Map, Value};

use super::types::{McpToolDefinition, ToolDeclaration};

// ─── Namespacing ─────────────────────────────────────────────────────────────

/// Separator between provider name and local tool name.
///
/// Provider names may not contain it or end with `_`, so the first
/// occurrence in a namespaced name is always the separator.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Build the caller-visible name for a provider-local tool.
pub fn namespaced_name(provider: &str, tool: &str) -> String {
    format!("{provider}{NAMESPACE_SEPARATOR}{tool}")
}

/// Split a namespaced name into `(provider, tool)`.
///
/// E.g., `"calendar__list_events"` → `("calendar", "list_events")`.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let (provider, tool) = name.split_once(NAMESPACE_SEPARATOR)?;
    if provider.is_empty() || tool.is_empty() {
        return None;
    }
    Some((provider, tool))
}

// ─── Schema Sanitization ─────────────────────────────────────────────────────

/// Keywords removed from every schema node.
pub const UNSUPPORTED_SCHEMA_KEYWORDS: &[&str] = &[
    "allOf",
    "anyOf",
    "oneOf",
    "not",
    "if",
    "then",
    "else",
    "$schema",
    "$id",
    "$comment",
    "$defs",
    "definitions",
    "additionalProperties",
    "additionalItems",
    "unevaluatedProperties",
    "unevaluatedItems",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "patternProperties",
    "dependencies",
    "dependentRequired",
    "dependentSchemas",
];

/// Schema used when a provider declares none.
pub fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Produce a copy of `schema` without the unsupported keywords.
///
/// Descends into `properties` values and `items` (a single schema or a
/// tuple). Property names themselves are never touched, so a property
/// called `not` survives. Applying this twice yields the same result.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(_) => {
            let mut out = schema.clone();
            strip_schema_node(&mut out);
            out
        }
        _ => empty_object_schema(),
    }
}

fn strip_schema_node(node: &mut Value) {
    let Value::Object(map) = node else {
        return;
    };

    for keyword in UNSUPPORTED_SCHEMA_KEYWORDS {
        map.remove(*keyword);
    }

    if let Some(Value::Object(properties)) = map.get_mut("properties") {
        for property_schema in properties.values_mut() {
            strip_schema_node(property_schema);
        }
    }

    match map.get_mut("items") {
        Some(Value::Array(tuple)) => tuple.iter_mut().for_each(strip_schema_node),
        Some(item_schema) => strip_schema_node(item_schema),
        None => {}
    }
}

// ─── Routing ─────────────────────────────────────────────────────────────────

/// Where a namespaced tool lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub provider: String,
    pub tool: String,
}

/// `namespaced name → (provider, local tool)`. Rebuilt wholesale, never patched.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Route>,
}

impl RoutingTable {
    /// Look up the owner of a namespaced tool.
    pub fn get(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// The unified catalog: ordered declarations plus their routing.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    declarations: Vec<ToolDeclaration>,
    routing: RoutingTable,
}

impl ToolCatalog {
    /// Build the catalog from every provider's discovered tools.
    ///
    /// Providers are visited in name order and tools in the order each
    /// provider reported them. A local name repeated within one provider
    /// keeps its first definition.
    pub fn build(tools_by_provider: &BTreeMap<String, Vec<McpToolDefinition>>) -> Self {
        let mut catalog = Self::default();

        for (provider, tools) in tools_by_provider {
            let mut seen = HashSet::new();

            for tool in tools {
                if !seen.insert(tool.name.as_str()) {
                    tracing::warn!(
                        server = %provider,
                        tool = %tool.name,
                        "duplicate tool name from provider, keeping first definition"
                    );
                    continue;
                }

                let name = namespaced_name(provider, &tool.name);
                catalog.routing.routes.insert(
                    name.clone(),
                    Route {
                        provider: provider.clone(),
                        tool: tool.name.clone(),
                    },
                );
                catalog.declarations.push(ToolDeclaration {
                    name,
                    description: tool.description.clone(),
                    parameters: sanitize_schema(&tool.input_schema),
                });
            }
        }

        catalog
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.declarations
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Number of tools in the catalog.
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Count tools belonging to a specific provider.
    pub fn tools_for_provider(&self, provider: &str) -> usize {
        self.routing
            .routes
            .values()
            .filter(|route| route.provider == provider)
            .count()
    }

    /// Serialize the catalog into OpenAI function-calling format.
    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.declarations
            .iter()
            .map(|decl| {
                let mut function = Map::new();
                function.insert("name".into(), Value::String(decl.name.clone()));
                function.insert("description".into(), Value::String(decl.description.clone()));
                function.insert("parameters".into(), decl.parameters.clone());
                json!({"type": "function", "function": function})
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
