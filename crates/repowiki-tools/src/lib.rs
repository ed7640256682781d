//! Tool registry and the built-in repository tools.
//!
//! A tool is a name, a description, an argument schema and a handler. The
//! registry validates arguments against the schema before dispatch and turns
//! every failure — unknown tool, bad arguments, handler error, handler panic —
//! into a `ToolResult { success: false }` the model can read and correct.

mod handlers;
mod schema;

pub use handlers::builtin_registry;
pub use schema::{ArgField, ArgKind, ArgSchema};

use repowiki_core::{FunctionDefinition, ToolDefinition, ToolResult};
use repowiki_index::IndexService;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

/// Shared read-only context handed to every handler.
pub struct ToolContext {
    pub repo_root: PathBuf,
    pub index: IndexService,
    /// Largest line span a single `get_excerpt` call may return.
    pub max_excerpt_lines: u64,
}

/// What a successful handler produces: structured data plus the summary text
/// the model sees.
pub struct ToolOutput {
    pub data: serde_json::Value,
    pub summary: String,
}

pub type ToolHandler =
    Box<dyn Fn(&serde_json::Value, &ToolContext) -> anyhow::Result<ToolOutput> + Send + Sync>;

pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: ArgSchema,
    pub handler: ToolHandler,
}

/// Ordered name→descriptor mapping. Owns the `ToolContext` (and through it
/// the index handle, which closes when the registry is dropped at run
/// teardown).
pub struct ToolRegistry {
    context: ToolContext,
    tools: Vec<ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new(context: ToolContext) -> Self {
        Self {
            context,
            tools: Vec::new(),
        }
    }

    /// Register a descriptor. Names are unique within a registry; a repeated
    /// name replaces the earlier descriptor in place.
    pub fn register(&mut self, descriptor: ToolDescriptor) {
        if let Some(slot) = self.tools.iter_mut().find(|t| t.name == descriptor.name) {
            *slot = descriptor;
        } else {
            self.tools.push(descriptor);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// One-line name/description pairs for the system prompt.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|t| (t.name.clone(), t.description.clone()))
            .collect()
    }

    /// Tool definitions in the provider's function-calling shape.
    pub fn tool_schemas(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.schema.to_json_schema(),
                },
            })
            .collect()
    }

    /// Deserialize, validate and dispatch one tool call. Never returns `Err`:
    /// every failure mode becomes a failed `ToolResult` whose summary tells
    /// the model what went wrong.
    pub fn execute_call(&self, name: &str, arguments_json: &str) -> ToolResult {
        let Some(descriptor) = self.tools.iter().find(|t| t.name == name) else {
            return ToolResult::fail(format!(
                "Unknown tool '{name}'. Available tools: {}",
                self.names().join(", ")
            ));
        };

        let raw = if arguments_json.trim().is_empty() {
            "{}"
        } else {
            arguments_json
        };
        let mut args: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => return ToolResult::fail(format!("Invalid JSON arguments: {err}")),
        };

        if let Err(errors) = descriptor.schema.validate_and_fill(&mut args) {
            return ToolResult::fail(format!("Validation failed: {}", errors.join("; ")));
        }

        match catch_unwind(AssertUnwindSafe(|| (descriptor.handler)(&args, &self.context))) {
            Ok(Ok(output)) => ToolResult::ok(output.data, output.summary),
            Ok(Err(err)) => ToolResult::fail(err.to_string()),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                ToolResult::fail(format!("tool '{name}' panicked: {detail}"))
            }
        }
    }
}
