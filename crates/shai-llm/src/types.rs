//! Core types for LLM interactions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
    FunctionCall,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
            Role::FunctionCall => "function_call",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A function invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub call_id: String,
}

impl FunctionCall {
    pub fn new(
        name: impl Into<String>,
        arguments: Map<String, Value>,
        call_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            arguments,
            call_id: call_id.into(),
        }
    }

    /// Parse raw JSON arguments as streamed by a provider.
    ///
    /// Empty input is an empty argument map. Anything that is not a JSON
    /// object is also mapped to an empty map and logged.
    pub fn parse_arguments(raw: &str) -> Map<String, Value> {
        if raw.trim().is_empty() {
            return Map::new();
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                tracing::warn!("Function arguments are not an object: {}", other);
                Map::new()
            }
            Err(e) => {
                tracing::warn!("Failed to parse function arguments '{}': {}", raw, e);
                Map::new()
            }
        }
    }

    /// Arguments as a JSON value (for schema validation and wire formats)
    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

/// Outcome of running a function, paired with its call by `call_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResult {
    pub name: String,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub call_id: String,
}

impl FunctionResult {
    /// Successful result for a call
    pub fn ok(call: &FunctionCall, result: impl Into<String>) -> Self {
        Self {
            name: call.name.clone(),
            result: result.into(),
            error: None,
            call_id: call.call_id.clone(),
        }
    }

    /// Failed result for a call
    pub fn failed(call: &FunctionCall, error: impl Into<String>) -> Self {
        Self {
            name: call.name.clone(),
            result: String::new(),
            error: Some(error.into()),
            call_id: call.call_id.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text handed back to the model for this result
    pub fn model_text(&self) -> String {
        match &self.error {
            Some(error) if self.result.is_empty() => format!("Error: {}", error),
            Some(error) => format!("{}\nError: {}", self.result, error),
            None => self.result.clone(),
        }
    }
}

/// A role-tagged conversation message.
///
/// Each role carries its own content shape: plain text for system, user and
/// assistant turns, a list of calls for `function_call`, and a list of
/// results for `function`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", content = "content", rename_all = "snake_case")]
pub enum Message {
    System(String),
    User(String),
    Assistant(String),
    FunctionCall(Vec<FunctionCall>),
    Function(Vec<FunctionResult>),
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System(text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User(text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant(text.into())
    }

    /// Create a `function_call` message holding a single call
    pub fn function_call(call: FunctionCall) -> Self {
        Self::FunctionCall(vec![call])
    }

    /// Create a `function` message holding a single result
    pub fn function_result(result: FunctionResult) -> Self {
        Self::Function(vec![result])
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System(_) => Role::System,
            Self::User(_) => Role::User,
            Self::Assistant(_) => Role::Assistant,
            Self::FunctionCall(_) => Role::FunctionCall,
            Self::Function(_) => Role::Function,
        }
    }

    /// Text content for system, user and assistant messages
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::System(text) | Self::User(text) | Self::Assistant(text) => Some(text),
            Self::FunctionCall(_) | Self::Function(_) => None,
        }
    }

    pub fn function_calls(&self) -> &[FunctionCall] {
        match self {
            Self::FunctionCall(calls) => calls,
            _ => &[],
        }
    }

    pub fn function_results(&self) -> &[FunctionResult] {
        match self {
            Self::Function(results) => results,
            _ => &[],
        }
    }
}

/// Schema for a single function parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterSchema>>,
}

impl ParameterSchema {
    fn of(kind: &str, description: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            description: Some(description.into()),
            enum_values: None,
            items: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::of("string", description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::of("integer", description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::of("boolean", description)
    }

    pub fn array(description: impl Into<String>, items: ParameterSchema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of("array", description)
        }
    }

    /// Restrict the parameter to a fixed set of values
    pub fn with_enum<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Object schema describing a function's arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameters {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, ParameterSchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for FunctionParameters {
    fn default() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

/// Declarative function definition advertised to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: FunctionParameters,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: FunctionParameters::default(),
        }
    }

    /// Add a parameter, optionally marking it as required
    pub fn param(mut self, name: impl Into<String>, schema: ParameterSchema, required: bool) -> Self {
        let name = name.into();
        if required && !self.parameters.required.contains(&name) {
            self.parameters.required.push(name.clone());
        }
        self.parameters.properties.insert(name, schema);
        self
    }

    /// The parameters as a JSON Schema document
    pub fn json_schema(&self) -> Value {
        serde_json::to_value(&self.parameters)
            .unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
    }
}

/// Token counts reported by a single provider call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

/// Accumulated token usage attributed to a model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
}

impl TokenUsage {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Add one provider call's usage
    pub fn record(&mut self, usage: Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign<&TokenUsage> for TokenUsage {
    fn add_assign(&mut self, rhs: &TokenUsage) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        if self.model.is_empty() {
            self.model = rhs.model.clone();
        }
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(mut self, rhs: TokenUsage) -> TokenUsage {
        self += &rhs;
        self
    }
}

/// Which function, if any, the provider may call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FunctionCallPolicy {
    /// The model decides
    #[default]
    Auto,
    /// No function calls allowed
    None,
    /// The model must call the named function
    Forced(String),
}

/// Options for a completion request
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Model identifier sent to the provider
    pub model: String,
    /// Functions the model may call
    pub functions: Vec<FunctionDefinition>,
    /// Function call policy
    pub function_call: FunctionCallPolicy,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
}

impl CompletionOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Final result of one provider call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResult {
    /// Visible assistant text (the concatenation of all streamed fragments)
    pub content: String,
    /// Function calls in the order the provider emitted them
    pub function_calls: Vec<FunctionCall>,
    /// Token usage, when the provider reports it
    pub usage: Option<Usage>,
}

impl CompletionResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn has_function_calls(&self) -> bool {
        !self.function_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::user("list files");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "role": "user", "content": "list files" })
        );

        let call = FunctionCall::new(
            "executeCommand",
            json!({ "command": "ls" }).as_object().unwrap().clone(),
            "c1",
        );
        let msg = Message::function_call(call);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "role": "function_call",
                "content": [{ "name": "executeCommand", "arguments": { "command": "ls" }, "call_id": "c1" }]
            })
        );
    }

    #[test]
    fn test_function_result_omits_missing_error() {
        let call = FunctionCall::new("f", Map::new(), "c9");
        let value = serde_json::to_value(Message::function_result(FunctionResult::ok(&call, "ok"))).unwrap();
        assert_eq!(value["content"][0]["result"], "ok");
        assert!(value["content"][0].get("error").is_none());
    }

    #[test]
    fn test_model_text_for_errors() {
        let call = FunctionCall::new("f", Map::new(), "c1");
        assert_eq!(FunctionResult::failed(&call, "boom").model_text(), "Error: boom");
        assert_eq!(FunctionResult::ok(&call, "fine").model_text(), "fine");
    }

    #[test]
    fn test_parse_arguments_tolerates_garbage() {
        assert!(FunctionCall::parse_arguments("").is_empty());
        assert!(FunctionCall::parse_arguments("[1,2]").is_empty());
        assert!(FunctionCall::parse_arguments("{not json").is_empty());
        let args = FunctionCall::parse_arguments(r#"{"command":"ls -la"}"#);
        assert_eq!(args["command"], "ls -la");
    }

    #[test]
    fn test_definition_schema() {
        let def = FunctionDefinition::new("executeCommand", "Run a shell command")
            .param("command", ParameterSchema::string("The command"), true)
            .param(
                "shell",
                ParameterSchema::string("Shell to use").with_enum(["sh", "bash"]),
                false,
            );
        assert_eq!(
            def.json_schema(),
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The command" },
                    "shell": { "type": "string", "description": "Shell to use", "enum": ["sh", "bash"] }
                },
                "required": ["command"]
            })
        );
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut total = TokenUsage::new("gpt-4o-mini");
        total.record(Usage::new(10, 5));
        total += &TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
            model: "other".into(),
        };
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.model, "gpt-4o-mini");
        assert_eq!(total.total_tokens(), 20);
    }
}
