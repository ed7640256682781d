//! Core ask loop.
//!
//! Each iteration consumes one model turn: the model either calls tools
//! (executed serially, in emission order, results fed back bounded by the
//! tool-output budget) or emits a DONE answer, which is verified against the
//! filesystem. Failed verification produces a repair prompt and the loop
//! continues; budget exhaustion triggers one forced-termination turn and, if
//! that does not verify, a synthesized fallback answer.

use crate::prompts::{build_repair_prompt, build_system_prompt, build_termination_prompt};
use repowiki_core::{
    AppConfig, ChatMessage, ChatRequest, Citation, LlmResponse, LlmToolCall, ToolChoice,
    ToolDefinition,
};
use repowiki_llm::LlmClient;
use repowiki_observe::Observer;
use repowiki_tools::ToolRegistry;
use repowiki_verify::{contains_sources_section, verify_answer};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const STEP_SUMMARY_CHARS: usize = 400;
const MESSAGE_SUMMARY_CHARS: usize = 200;
const CRUMB_CHARS: usize = 160;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_steps: u32,
    pub max_excerpt_lines: u64,
    pub max_tool_output_chars: usize,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            temperature: None,
            max_steps: 8,
            max_excerpt_lines: 120,
            max_tool_output_chars: 8000,
        }
    }
}

impl AskOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            model: cfg.llm.model.clone(),
            max_tokens: cfg.llm.max_tokens,
            temperature: Some(cfg.llm.temperature),
            max_steps: cfg.agent.max_steps,
            max_excerpt_lines: cfg.agent.max_excerpt_lines,
            max_tool_output_chars: cfg.agent.max_tool_output_chars,
        }
    }
}

/// One entry in the append-only step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_no: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_input: Option<serde_json::Value>,
    /// Head-clipped tool output.
    pub tool_output_summary: String,
    pub elapsed_ms: u64,
    pub model_message_summary: String,
    pub is_done: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub verifier_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub verifier_errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResult {
    pub run_id: Uuid,
    pub answer_markdown: String,
    pub steps: Vec<StepRecord>,
    pub verified_citations: Vec<Citation>,
    pub verified: bool,
    pub total_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Classified model response.
enum ModelTurn {
    ToolCalls(Vec<LlmToolCall>),
    Done(String),
    Unexpected(String),
}

fn classify(response: &LlmResponse) -> ModelTurn {
    if !response.tool_calls.is_empty() {
        return ModelTurn::ToolCalls(response.tool_calls.clone());
    }
    let trimmed = response.text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("DONE") {
        return ModelTurn::Done(rest.trim().to_string());
    }
    // Forgiving fallback: an answer-shaped reply that skipped the sentinel.
    if contains_sources_section(&response.text) && response.text.contains('`') {
        return ModelTurn::Done(response.text.trim().to_string());
    }
    ModelTurn::Unexpected(response.text.clone())
}

pub struct AskAgent<'a> {
    llm: &'a (dyn LlmClient + Send + Sync),
    registry: ToolRegistry,
    options: AskOptions,
    observer: Option<&'a Observer>,
    cancel: Option<Arc<AtomicBool>>,
    run_id: Uuid,
}

impl<'a> AskAgent<'a> {
    pub fn new(
        llm: &'a (dyn LlmClient + Send + Sync),
        registry: ToolRegistry,
        options: AskOptions,
    ) -> Self {
        Self {
            llm,
            registry,
            options,
            observer: None,
            cancel: None,
            run_id: Uuid::now_v7(),
        }
    }

    pub fn with_observer(mut self, observer: &'a Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Cooperative cancellation: checked before every model call and between
    /// sequential tool invocations.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    /// Run the loop to completion. Consuming `self` tears the run down:
    /// dropping the registry closes the index handle exactly once.
    pub fn ask(self, question: &str) -> AskResult {
        let run_start = Instant::now();
        self.observe(&format!("run {} started", self.run_id));
        let repo_root = self.registry.context().repo_root.clone();
        let system = build_system_prompt(
            self.options.max_steps,
            self.options.max_excerpt_lines,
            &self.registry.descriptions(),
        );
        let tools = self.registry.tool_schemas();

        let mut transcript = vec![
            ChatMessage::System { content: system },
            ChatMessage::User {
                content: question.to_string(),
            },
        ];
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut evidence: Vec<String> = Vec::new();
        let mut step_no: u32 = 0;
        let mut terminal_error: Option<String> = None;

        'outer: while step_no < self.options.max_steps {
            if self.is_cancelled() {
                terminal_error = Some("Cancelled".to_string());
                break;
            }
            step_no += 1;
            let turn_start = Instant::now();
            self.observe(&format!("step {step_no}: calling model"));

            let request = self.build_request(&transcript, &tools);
            let response = match self.llm.complete_chat(&request) {
                Ok(response) => response,
                Err(err) => {
                    steps.push(StepRecord {
                        step_no,
                        tool_name: None,
                        tool_input: None,
                        tool_output_summary: String::new(),
                        elapsed_ms: ms_since(turn_start),
                        model_message_summary: format!("provider error: {err}"),
                        is_done: false,
                        verifier_passed: None,
                        verifier_errors: None,
                    });
                    terminal_error = Some(format!("Provider error: {err}"));
                    break;
                }
            };

            match classify(&response) {
                ModelTurn::ToolCalls(calls) => {
                    transcript.push(ChatMessage::Assistant {
                        content: if response.text.is_empty() {
                            None
                        } else {
                            Some(response.text.clone())
                        },
                        tool_calls: calls.clone(),
                    });
                    for call in &calls {
                        if self.is_cancelled() {
                            steps.push(StepRecord {
                                step_no,
                                tool_name: Some(call.name.clone()),
                                tool_input: None,
                                tool_output_summary: String::new(),
                                elapsed_ms: ms_since(turn_start),
                                model_message_summary: "cancelled before tool execution"
                                    .to_string(),
                                is_done: false,
                                verifier_passed: None,
                                verifier_errors: None,
                            });
                            terminal_error = Some("Cancelled".to_string());
                            break 'outer;
                        }
                        let tool_start = Instant::now();
                        let result = self.registry.execute_call(&call.name, &call.arguments);
                        let bounded =
                            truncate_middle(&result.output_summary, self.options.max_tool_output_chars);
                        transcript.push(ChatMessage::Tool {
                            tool_call_id: call.id.clone(),
                            content: bounded.clone(),
                        });
                        if result.success {
                            evidence.push(crumb(&call.name, &result.output_summary));
                        }
                        self.observe(&format!(
                            "step {step_no}: {} success={}",
                            call.name, result.success
                        ));
                        steps.push(StepRecord {
                            step_no,
                            tool_name: Some(call.name.clone()),
                            tool_input: serde_json::from_str(&call.arguments).ok(),
                            tool_output_summary: head(&bounded, STEP_SUMMARY_CHARS),
                            elapsed_ms: ms_since(tool_start),
                            model_message_summary: format!("tool call {}", call.name),
                            is_done: false,
                            verifier_passed: None,
                            verifier_errors: None,
                        });
                    }
                }
                ModelTurn::Done(candidate) => {
                    let verification = verify_answer(&candidate, &repo_root);
                    let passed = verification.valid;
                    steps.push(StepRecord {
                        step_no,
                        tool_name: None,
                        tool_input: None,
                        tool_output_summary: String::new(),
                        elapsed_ms: ms_since(turn_start),
                        model_message_summary: head(&candidate, MESSAGE_SUMMARY_CHARS),
                        is_done: passed,
                        verifier_passed: Some(passed),
                        verifier_errors: if passed {
                            None
                        } else {
                            Some(
                                verification
                                    .errors
                                    .iter()
                                    .map(|e| format!("{}: {}", e.reference, e.reason))
                                    .collect(),
                            )
                        },
                    });
                    if passed {
                        self.observe(&format!(
                            "step {step_no}: answer verified with {} citation(s)",
                            verification.citations.len()
                        ));
                        return self.finish(
                            candidate,
                            steps,
                            verification.citations,
                            true,
                            run_start,
                            None,
                        );
                    }
                    self.observe(&format!(
                        "step {step_no}: verification failed with {} error(s)",
                        verification.errors.len()
                    ));
                    transcript.push(ChatMessage::Assistant {
                        content: Some(response.text.clone()),
                        tool_calls: vec![],
                    });
                    let pairs: Vec<(String, String)> = verification
                        .errors
                        .iter()
                        .map(|e| (e.reference.clone(), e.reason.clone()))
                        .collect();
                    transcript.push(ChatMessage::User {
                        content: build_repair_prompt(&pairs),
                    });
                }
                ModelTurn::Unexpected(text) => {
                    self.observe(&format!("step {step_no}: unexpected content"));
                    transcript.push(ChatMessage::Assistant {
                        content: Some(text.clone()),
                        tool_calls: vec![],
                    });
                    steps.push(StepRecord {
                        step_no,
                        tool_name: None,
                        tool_input: None,
                        tool_output_summary: String::new(),
                        elapsed_ms: ms_since(turn_start),
                        model_message_summary: head(&text, MESSAGE_SUMMARY_CHARS),
                        is_done: false,
                        verifier_passed: None,
                        verifier_errors: None,
                    });
                }
            }
        }

        if let Some(error) = terminal_error {
            let answer = fallback_answer(&evidence);
            return self.finish(answer, steps, Vec::new(), false, run_start, Some(error));
        }

        // Forced termination: one final model turn, tools withheld.
        step_no += 1;
        self.observe(&format!("step {step_no}: forced termination"));
        transcript.push(ChatMessage::User {
            content: build_termination_prompt(&evidence),
        });
        let turn_start = Instant::now();
        let request = self.build_request(&transcript, &[]);
        match self.llm.complete_chat(&request) {
            Ok(response) => {
                if let ModelTurn::Done(candidate) = classify(&response) {
                    let verification = verify_answer(&candidate, &repo_root);
                    let passed = verification.valid;
                    steps.push(StepRecord {
                        step_no,
                        tool_name: None,
                        tool_input: None,
                        tool_output_summary: String::new(),
                        elapsed_ms: ms_since(turn_start),
                        model_message_summary: head(&candidate, MESSAGE_SUMMARY_CHARS),
                        is_done: passed,
                        verifier_passed: Some(passed),
                        verifier_errors: if passed {
                            None
                        } else {
                            Some(
                                verification
                                    .errors
                                    .iter()
                                    .map(|e| format!("{}: {}", e.reference, e.reason))
                                    .collect(),
                            )
                        },
                    });
                    if passed {
                        return self.finish(
                            candidate,
                            steps,
                            verification.citations,
                            true,
                            run_start,
                            None,
                        );
                    }
                } else {
                    steps.push(StepRecord {
                        step_no,
                        tool_name: None,
                        tool_input: None,
                        tool_output_summary: String::new(),
                        elapsed_ms: ms_since(turn_start),
                        model_message_summary: "no final answer produced".to_string(),
                        is_done: false,
                        verifier_passed: None,
                        verifier_errors: None,
                    });
                }
            }
            Err(err) => {
                steps.push(StepRecord {
                    step_no,
                    tool_name: None,
                    tool_input: None,
                    tool_output_summary: String::new(),
                    elapsed_ms: ms_since(turn_start),
                    model_message_summary: format!("provider error: {err}"),
                    is_done: false,
                    verifier_passed: None,
                    verifier_errors: None,
                });
            }
        }

        let answer = fallback_answer(&evidence);
        self.finish(
            answer,
            steps,
            Vec::new(),
            false,
            run_start,
            Some("Max steps exceeded".to_string()),
        )
    }

    fn finish(
        self,
        answer_markdown: String,
        steps: Vec<StepRecord>,
        verified_citations: Vec<Citation>,
        verified: bool,
        run_start: Instant,
        error: Option<String>,
    ) -> AskResult {
        if let Some(observer) = self.observer {
            let _ = observer.record(&format!(
                "run {} finished verified={verified} steps={} error={:?}",
                self.run_id,
                steps.len(),
                error
            ));
        }
        AskResult {
            run_id: self.run_id,
            answer_markdown,
            steps,
            verified_citations,
            verified,
            total_ms: ms_since(run_start),
            error,
        }
    }

    fn build_request(&self, transcript: &[ChatMessage], tools: &[ToolDefinition]) -> ChatRequest {
        ChatRequest {
            model: self.options.model.clone(),
            messages: transcript.to_vec(),
            tools: tools.to_vec(),
            tool_choice: ToolChoice::auto(),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn observe(&self, msg: &str) {
        if let Some(observer) = self.observer {
            observer.verbose_log(msg);
        }
    }
}

fn ms_since(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// First line of a successful tool output, tagged with the tool name. These
/// crumbs parametrize the forced-termination prompt and the fallback answer.
fn crumb(tool_name: &str, summary: &str) -> String {
    let first_line = summary.lines().next().unwrap_or_default();
    head(&format!("{tool_name}: {first_line}"), CRUMB_CHARS)
}

fn head(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{clipped}…")
}

/// Head/tail elision: preserve roughly the first and last halves around a
/// `… N chars truncated …` marker.
fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(40).max(2);
    let head_len = keep / 2;
    let tail_len = keep - head_len;
    let head_part: String = text.chars().take(head_len).collect();
    let tail_part: String = {
        let mut tail: Vec<char> = text.chars().rev().take(tail_len).collect();
        tail.reverse();
        tail.into_iter().collect()
    };
    let omitted = total - head_len - tail_len;
    format!("{head_part}\n… {omitted} chars truncated …\n{tail_part}")
}

fn fallback_answer(evidence: &[String]) -> String {
    let mut out =
        String::from("I could not produce a verified answer within the step budget.\n");
    if !evidence.is_empty() {
        out.push_str("\nEvidence gathered:\n");
        for crumb in evidence {
            out.push_str(&format!("- {crumb}\n"));
        }
    }
    out.push_str("\n## Sources\n(No verified sources available)\n");
    out
}
