// ABOUTME: Per-conversation cache of client tool definitions.
// ABOUTME: Resolves namespaced tool names and normalizes argument keys against the cached schemas.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tool the client declared on its request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the arguments object
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: Option<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description,
            input_schema,
        }
    }

    fn properties(&self) -> Option<&Map<String, Value>> {
        self.input_schema.get("properties").and_then(Value::as_object)
    }
}

/// Grep-style flags agents like to spell out in full. An alias only applies
/// when its target is a declared property.
const ARGUMENT_ALIASES: &[(&str, &str)] = &[
    ("ignoreCase", "-i"),
    ("caseInsensitive", "-i"),
    ("lineNumbers", "-n"),
    ("showLineNumbers", "-n"),
    ("contextLines", "-C"),
    ("afterContext", "-A"),
    ("beforeContext", "-B"),
];

#[derive(Debug, Clone, Default)]
pub struct ToolCache {
    tools: Vec<ToolDefinition>,
    separator: String,
    /// What the backend prepends to tools it reaches through the bridge
    bridge_prefix: Option<String>,
}

impl ToolCache {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            tools: Vec::new(),
            separator: separator.into(),
            bridge_prefix: None,
        }
    }

    pub fn with_bridge_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bridge_prefix = Some(prefix.into()).filter(|p| !p.is_empty());
        self
    }

    /// Replace the cached tools wholesale
    pub fn cache_tools(&mut self, tools: Vec<ToolDefinition>) {
        self.tools = tools;
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Text after the last namespace separator, or the whole name
    pub fn strip_namespace<'a>(&self, name: &'a str) -> &'a str {
        if self.separator.is_empty() {
            return name;
        }
        name.rsplit_once(self.separator.as_str())
            .map(|(_, tail)| tail)
            .unwrap_or(name)
    }

    /// Tools as advertised on the MCP bridge, namespace stripped
    pub fn listed_tools(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: self.strip_namespace(&t.name).to_string(),
                ..t.clone()
            })
            .collect()
    }

    /// Map a name an agent used back to the client's exact tool name.
    ///
    /// An exact match wins. Otherwise a single cached name ending in
    /// `<separator><name>` is taken. Only for names carrying the bridge's
    /// own prefix (`mcp__<server>__`), that prefix is removed and the same
    /// two checks run on the remainder. Anything ambiguous or unknown comes
    /// back unchanged.
    pub fn resolve_name(&self, name: &str) -> String {
        if let Some(found) = self.lookup(name) {
            return found;
        }
        let bridged = self
            .bridge_prefix
            .as_deref()
            .and_then(|prefix| name.strip_prefix(prefix))
            .filter(|rest| !rest.is_empty());
        if let Some(found) = bridged.and_then(|rest| self.lookup(rest)) {
            return found;
        }
        name.to_string()
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if self.get(name).is_some() {
            return Some(name.to_string());
        }
        if self.separator.is_empty() {
            return None;
        }
        let suffix = format!("{}{}", self.separator, name);
        let mut matches = self.tools.iter().filter(|t| t.name.ends_with(&suffix));
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(only.name.clone()),
            _ => None,
        }
    }

    /// Rewrite argument keys and enum values to the spellings the named
    /// tool's schema declares. Unknown tools and non-object arguments pass
    /// through untouched.
    pub fn normalize_arguments(&self, name: &str, arguments: Value) -> Value {
        let Some(props) = self.get(name).and_then(ToolDefinition::properties) else {
            return arguments;
        };
        let Value::Object(map) = arguments else {
            return arguments;
        };

        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            let target = if props.contains_key(&key) {
                key
            } else {
                key_candidates(&key)
                    .into_iter()
                    .find(|candidate| props.contains_key(candidate))
                    .unwrap_or(key)
            };
            let value = match props.get(&target) {
                Some(prop) => normalize_enum_value(prop, value),
                None => value,
            };
            out.insert(target, value);
        }
        Value::Object(out)
    }
}

fn key_candidates(key: &str) -> Vec<String> {
    let mut candidates = vec![to_snake_case(key), to_camel_case(key)];
    candidates.extend(
        ARGUMENT_ALIASES
            .iter()
            .filter(|(alias, _)| *alias == key)
            .map(|(_, target)| target.to_string()),
    );
    candidates
}

fn normalize_enum_value(prop: &Value, value: Value) -> Value {
    let Some(allowed) = prop.get("enum").and_then(Value::as_array) else {
        return value;
    };
    let Value::String(s) = &value else {
        return value;
    };
    if allowed.iter().any(|v| v.as_str() == Some(s.as_str())) {
        return value;
    }
    [to_snake_case(s), to_camel_case(s)]
        .into_iter()
        .find(|candidate| allowed.iter().any(|v| v.as_str() == Some(candidate.as_str())))
        .map(Value::String)
        .unwrap_or(value)
}

fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn to_camel_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = false;
    for c in s.chars() {
        if c == '_' && !out.is_empty() {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
