//! End-to-end loop tests driven by a scripted provider.

use anyhow::{anyhow, Result};
use repowiki_agent::{AskAgent, AskOptions};
use repowiki_core::{ChatRequest, LlmResponse, LlmToolCall};
use repowiki_index::IndexService;
use repowiki_llm::LlmClient;
use repowiki_tools::{builtin_registry, ToolContext, ToolRegistry};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ── Scripted LLM ──

struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
        }
    }
}

impl LlmClient for ScriptedLlm {
    fn complete_chat(&self, _req: &ChatRequest) -> Result<LlmResponse> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted llm exhausted"))
    }
}

fn tool_call_response(calls: Vec<(&str, &str, &str)>) -> LlmResponse {
    LlmResponse {
        text: String::new(),
        finish_reason: "tool_calls".to_string(),
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| LlmToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect(),
        usage: None,
    }
}

fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        finish_reason: "stop".to_string(),
        tool_calls: vec![],
        usage: None,
    }
}

// ── Fixture ──

fn seed_repo(root: &Path) {
    // foo.ts with exactly 10 lines.
    let body: String = (1..=10).map(|i| format!("const line{i} = {i};\n")).collect();
    fs::write(root.join("foo.ts"), body).expect("seed foo.ts");
}

fn registry_for(root: &Path) -> ToolRegistry {
    let mut index = IndexService::open(root).expect("index");
    index.index_repository().expect("build index");
    builtin_registry(ToolContext {
        repo_root: root.to_path_buf(),
        index,
        max_excerpt_lines: 120,
    })
}

fn options(max_steps: u32) -> AskOptions {
    AskOptions {
        max_steps,
        ..AskOptions::default()
    }
}

// ── Scenarios ──

/// Happy path: one excerpt read, then a verified DONE answer.
#[test]
fn happy_path_verifies_citation() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![
        tool_call_response(vec![(
            "call_1",
            "get_excerpt",
            r#"{"path":"foo.ts","startLine":1,"endLine":5}"#,
        )]),
        text_response("DONE\n\nAnswer.\n\n## Sources\n- `foo.ts`:1-5"),
    ]);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(8));
    let result = agent.ask("What is in foo.ts?");

    assert!(result.verified, "error: {:?}", result.error);
    assert_eq!(result.verified_citations.len(), 1);
    assert_eq!(result.verified_citations[0].path, "foo.ts");
    assert_eq!(result.verified_citations[0].start_line, 1);
    assert_eq!(result.verified_citations[0].end_line, 5);
    assert_eq!(result.steps.len(), 2);
    assert!(result.answer_markdown.contains("## Sources"));
    assert!(result.error.is_none());
}

/// A bad citation triggers a repair prompt; the repaired answer verifies.
#[test]
fn repair_then_success() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![
        tool_call_response(vec![(
            "call_1",
            "search_chunks",
            r#"{"query":"x","topK":1}"#,
        )]),
        text_response("DONE\n\nWrong.\n\n## Sources\n- `missing.ts`:1-2"),
        tool_call_response(vec![(
            "call_2",
            "get_excerpt",
            r#"{"path":"foo.ts","startLine":1,"endLine":3}"#,
        )]),
        text_response("DONE\n\nFixed.\n\n## Sources\n- `foo.ts`:1-3"),
    ]);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(8));
    let result = agent.ask("Where is x defined?");

    assert!(result.verified);
    assert_eq!(result.steps.len(), 4);
    let failed: Vec<_> = result
        .steps
        .iter()
        .filter(|s| s.verifier_passed == Some(false))
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .verifier_errors
        .as_ref()
        .unwrap()
        .iter()
        .any(|e| e.contains("file not found")));
    assert_eq!(result.verified_citations[0].end_line, 3);
}

/// A path-escaping citation is rejected with an "outside repository" error.
#[test]
fn path_escape_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![text_response(
        "DONE\n\nLeak.\n\n## Sources\n- `../etc/passwd`:1-1",
    )]);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(1));
    let result = agent.ask("Show me secrets");

    assert!(!result.verified);
    let errors = result.steps[0].verifier_errors.as_ref().unwrap();
    assert!(errors.iter().any(|e| e.contains("outside repository")));
}

/// Step exhaustion produces the fallback answer and the budget error.
#[test]
fn step_exhaustion_falls_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    // The provider never emits DONE: tool calls on every turn, including the
    // forced-termination one.
    let responses: Vec<LlmResponse> = (0..3)
        .map(|i| {
            tool_call_response(vec![(
                &format!("call_{i}"),
                "search_chunks",
                r#"{"query":"line1","topK":1}"#,
            )])
        })
        .collect();
    let llm = ScriptedLlm::new(responses);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(2));
    let result = agent.ask("Loop forever");

    assert!(!result.verified);
    assert_eq!(result.error.as_deref(), Some("Max steps exceeded"));
    assert!(result.answer_markdown.contains("## Sources"));
    assert!(result
        .answer_markdown
        .contains("(No verified sources available)"));
    // 2 budget turns + the forced-termination turn.
    assert_eq!(result.steps.len(), 3);
}

/// Unknown tools are reported back with the list of registered names and the
/// loop continues.
#[test]
fn unknown_tool_feeds_back_and_continues() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![
        tool_call_response(vec![("call_1", "frobnicate", "{}")]),
        text_response("DONE\n\nRecovered.\n\n## Sources\n- `foo.ts`:1-2"),
    ]);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(8));
    let result = agent.ask("Use a bogus tool");

    assert!(result.verified);
    let first = &result.steps[0];
    assert_eq!(first.tool_name.as_deref(), Some("frobnicate"));
    assert!(first.tool_output_summary.contains("Unknown tool 'frobnicate'"));
    assert!(first.tool_output_summary.contains("search_chunks"));
    assert!(first.tool_output_summary.contains("get_excerpt"));
}

/// Schema-invalid arguments come back as a validation failure; the loop
/// continues.
#[test]
fn invalid_arguments_feed_back_and_continue() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![
        tool_call_response(vec![(
            "call_1",
            "get_excerpt",
            r#"{"path":"foo.ts","startLine":-1,"endLine":3}"#,
        )]),
        text_response("DONE\n\nRecovered.\n\n## Sources\n- `foo.ts`:1-3"),
    ]);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(8));
    let result = agent.ask("Read with a bad range");

    assert!(result.verified);
    assert!(result.steps[0]
        .tool_output_summary
        .contains("Validation failed"));
}

/// Multiple invocations in one turn execute serially in emission order.
#[test]
fn serial_multi_tool_turn_preserves_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![
        tool_call_response(vec![
            ("call_1", "search_chunks", r#"{"query":"line1"}"#),
            (
                "call_2",
                "get_excerpt",
                r#"{"path":"foo.ts","startLine":1,"endLine":2}"#,
            ),
        ]),
        text_response("DONE\n\nBoth ran.\n\n## Sources\n- `foo.ts`:1-2"),
    ]);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(8));
    let result = agent.ask("Search then read");

    assert!(result.verified);
    let tool_steps: Vec<_> = result
        .steps
        .iter()
        .filter_map(|s| s.tool_name.as_deref())
        .collect();
    assert_eq!(tool_steps, vec!["search_chunks", "get_excerpt"]);
    // Both tool records belong to the same model turn.
    assert_eq!(result.steps[0].step_no, result.steps[1].step_no);
}

/// A provider failure terminates the run with an error but still returns an
/// answer shell.
#[test]
fn provider_error_terminates_with_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![]);
    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(8));
    let result = agent.ask("Anything");

    assert!(!result.verified);
    assert!(result.error.as_deref().unwrap().contains("Provider error"));
    assert!(result.answer_markdown.contains("## Sources"));
}

/// Cancellation is observed before the first model call.
#[test]
fn cancellation_stops_promptly() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![text_response("unused")]);
    let mut agent = AskAgent::new(&llm, registry_for(dir.path()), options(8));
    let flag = Arc::new(AtomicBool::new(false));
    flag.store(true, Ordering::Relaxed);
    agent.set_cancel_flag(flag);

    let result = agent.ask("Cancelled before start");
    assert!(!result.verified);
    assert_eq!(result.error.as_deref(), Some("Cancelled"));
    assert!(result.steps.is_empty());
}

/// The forgiving DONE fallback: a Sources-shaped answer without the sentinel
/// still finalizes.
#[test]
fn sources_shaped_answer_without_sentinel_finalizes() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let llm = ScriptedLlm::new(vec![text_response(
        "The file defines ten constants.\n\n## Sources\n- `foo.ts`:1-10",
    )]);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(8));
    let result = agent.ask("Summarize foo.ts");

    assert!(result.verified);
    assert_eq!(result.verified_citations[0].end_line, 10);
}

/// Step count never exceeds maxSteps + 1 even when every turn is a repair.
#[test]
fn repair_turns_consume_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_repo(dir.path());

    let responses: Vec<LlmResponse> = (0..4)
        .map(|_| text_response("DONE\n\nBad.\n\n## Sources\n- `missing.ts`:1-1"))
        .collect();
    let llm = ScriptedLlm::new(responses);

    let agent = AskAgent::new(&llm, registry_for(dir.path()), options(3));
    let result = agent.ask("Never valid");

    assert!(!result.verified);
    assert_eq!(result.error.as_deref(), Some("Max steps exceeded"));
    assert!(result.steps.len() <= 4);
    assert!(result
        .steps
        .iter()
        .all(|s| s.verifier_passed == Some(false)));
}
