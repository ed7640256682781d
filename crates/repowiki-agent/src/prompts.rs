//! System and repair prompts for the ask loop.

/// Build the system prompt: tool list, budgets, citation requirement, the
/// DONE sentinel, and a worked example with a Sources section.
pub fn build_system_prompt(
    max_steps: u32,
    max_excerpt_lines: u64,
    tools: &[(String, String)],
) -> String {
    let tool_lines = tools
        .iter()
        .map(|(name, description)| format!("- {name}: {description}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a repository question-answering agent. You answer questions about a codebase using tools that search and read the repository. You never guess: every factual claim in your final answer must be backed by a citation pointing at real lines in real files.

## Rules
1. Use the tools to locate evidence before answering. Search first, then read the exact lines.
2. When your answer is ready, reply with DONE as the very first word, followed by the answer in markdown. DONE is the only signal for a final answer.
3. The answer must end with a section starting with `## Sources` containing at least one citation line of the form:
   - `path/to/file.ts`:12-48
   Paths are repository-relative; line numbers are 1-based and inclusive.
4. Cite only ranges you actually read with get_excerpt or saw in search results. Invalid citations are rejected and you will be asked to repair them.

## Budgets
- You have at most {max_steps} model turns in total, including repairs.
- get_excerpt returns at most {max_excerpt_lines} lines per call; read in focused chunks.

## Tools
{tool_lines}

## Example final answer
DONE

The request dispatcher lives in `src/router.ts`; it retries failed upstream calls twice before surfacing an error.

## Sources
- `src/router.ts`:12-48
"#
    )
}

/// Repair message appended after a failed verification: enumerate what was
/// wrong and instruct the model to gather evidence and re-emit.
pub fn build_repair_prompt(errors: &[(String, String)]) -> String {
    let error_lines = errors
        .iter()
        .map(|(reference, reason)| format!("- {reference}: {reason}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Your answer failed source verification:\n{error_lines}\n\nContinue using the tools to find accurate evidence (search_chunks, then get_excerpt to confirm exact line ranges), then re-emit the complete answer starting with DONE and ending with a corrected ## Sources section."
    )
}

/// Final-turn message when the step budget is exhausted.
pub fn build_termination_prompt(evidence: &[String]) -> String {
    let evidence_block = if evidence.is_empty() {
        "(no tool evidence was gathered)".to_string()
    } else {
        evidence
            .iter()
            .map(|crumb| format!("- {crumb}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "You have reached the step limit. Stop using tools. Using only the evidence gathered so far, emit your final answer now: start with DONE and end with a ## Sources section citing real files.\n\nEvidence gathered:\n{evidence_block}"
    )
}
