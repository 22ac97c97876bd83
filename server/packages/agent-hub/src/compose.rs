//! Context-window composition: rebuilds the per-turn injected prompt from the
//! durable summary, recent visible turns and the current input, within a
//! character budget measured in runes.

use agent_hub_storage::Turn;

const TRIM_LOOP_BOUND: usize = 256;

/// Composes the injected prompt. A `max_chars` of zero means unlimited.
///
/// The very first turn (no summary, no visible history) passes the raw input
/// through so slash-command style inputs are not masked by context headings.
pub fn compose_context_prompt(
    summary: &str,
    recent_turns: &[Turn],
    current_input: &str,
    max_chars: usize,
) -> String {
    let mut summary = summary.trim().to_string();
    let mut current_input = current_input.trim().to_string();
    let mut recent: Vec<&Turn> = recent_turns.iter().collect();

    if summary.is_empty() && recent.is_empty() {
        if max_chars == 0 || rune_len(&current_input) <= max_chars {
            return current_input;
        }
        return clamp_to_chars(&current_input, max_chars);
    }

    for _ in 0..TRIM_LOOP_BOUND {
        let prompt = render_context_prompt(&summary, &recent, &current_input);
        if max_chars == 0 || rune_len(&prompt) <= max_chars {
            return prompt;
        }

        if !recent.is_empty() {
            recent.remove(0);
            continue;
        }

        let summary_len = rune_len(&summary);
        if summary_len > 0 {
            let keep = summary_len.saturating_sub(std::cmp::max(1, summary_len / 4));
            summary = clamp_to_chars(&summary, keep);
            continue;
        }

        let input_len = rune_len(&current_input);
        if input_len > 0 {
            let keep = input_len.saturating_sub(std::cmp::max(1, input_len / 4));
            current_input = truncate_from_end(&current_input, keep);
            continue;
        }

        return clamp_to_chars(&prompt, max_chars);
    }

    clamp_to_chars(
        &render_context_prompt(&summary, &recent, &current_input),
        max_chars,
    )
}

/// The fixed instruction injected by the compact endpoint in place of user
/// input.
pub fn compact_instruction(max_summary_chars: usize) -> String {
    format!(
        "Please generate an updated rolling summary of the conversation. \
         Output plain text only, keep key decisions/constraints, and limit to \
         {max_summary_chars} characters."
    )
}

fn render_context_prompt(summary: &str, recent_turns: &[&Turn], current_input: &str) -> String {
    let mut output = String::new();
    output.push_str("[Conversation Summary]\n");
    if summary.is_empty() {
        output.push_str("(empty)");
    } else {
        output.push_str(summary);
    }

    output.push_str("\n\n[Recent Turns]\n");
    if recent_turns.is_empty() {
        output.push_str("(none)");
    } else {
        for turn in recent_turns {
            output.push_str("User: ");
            output.push_str(turn.request_text.trim());
            output.push_str("\nAssistant: ");
            output.push_str(turn.response_text.trim());
            output.push('\n');
        }
        output.push_str("----");
    }

    output.push_str("\n\n[Current User Input]\n");
    output.push_str(current_input);
    output
}

/// Keeps the leading `max_chars` runes.
pub fn clamp_to_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if rune_len(text) <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Keeps the trailing `max_chars` runes, preserving the user's most recent
/// wording.
fn truncate_from_end(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = rune_len(text);
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

pub fn rune_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use agent_hub_storage::Turn;
    use chrono::Utc;

    use super::*;

    fn turn(request: &str, response: &str) -> Turn {
        Turn {
            turn_id: String::new(),
            thread_id: String::new(),
            request_text: request.to_string(),
            response_text: response.to_string(),
            is_internal: false,
            status: "completed".to_string(),
            stop_reason: "end_turn".to_string(),
            error_message: String::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn first_turn_passes_input_through_verbatim() {
        let prompt = compose_context_prompt("", &[], "/mcp call list-tools", 20_000);
        assert_eq!(prompt, "/mcp call list-tools");
    }

    #[test]
    fn first_turn_is_still_rune_truncated() {
        let prompt = compose_context_prompt("", &[], "héllo wörld", 5);
        assert_eq!(prompt, "héllo");
    }

    #[test]
    fn rendered_prompt_carries_all_three_sections() {
        let turns = vec![turn("what is rust", "a systems language")];
        let prompt = compose_context_prompt("prior summary", &turns, "and tokio?", 0);

        assert!(prompt.starts_with("[Conversation Summary]\nprior summary"));
        assert!(prompt.contains("[Recent Turns]\nUser: what is rust\nAssistant: a systems language\n----"));
        assert!(prompt.ends_with("[Current User Input]\nand tokio?"));
    }

    #[test]
    fn empty_sections_render_placeholders() {
        let turns = vec![turn("earlier", "answer")];
        let prompt = compose_context_prompt("", &turns, "next", 0);
        assert!(prompt.contains("[Conversation Summary]\n(empty)"));

        let prompt = compose_context_prompt("something", &[], "next", 0);
        assert!(prompt.contains("[Recent Turns]\n(none)"));
    }

    #[test]
    fn trim_drops_oldest_turns_first() {
        let turns = vec![
            turn(&"old ".repeat(200), &"old ".repeat(200)),
            turn("recent question", "recent answer"),
        ];
        let prompt = compose_context_prompt("summary", &turns, "now", 400);

        assert!(!prompt.contains("old old"));
        assert!(prompt.contains("recent question"));
        assert!(rune_len(&prompt) <= 400);
    }

    #[test]
    fn input_trimming_preserves_the_tail() {
        let input = format!("{}{}", "x".repeat(400), " keep this ending");
        let prompt = compose_context_prompt("s", &[], &input, 120);

        assert!(rune_len(&prompt) <= 120);
        assert!(prompt.ends_with("keep this ending"));
    }

    #[test]
    fn recompose_of_composed_output_stays_within_budget() {
        let turns = vec![
            turn(&"alpha ".repeat(100), &"beta ".repeat(100)),
            turn(&"gamma ".repeat(100), &"delta ".repeat(100)),
        ];
        let first = compose_context_prompt(&"s".repeat(500), &turns, &"input ".repeat(50), 600);
        let second = compose_context_prompt(&first, &[], "", 600);
        assert!(rune_len(&second) <= 600);
    }

    #[test]
    fn compact_instruction_names_the_limit() {
        let instruction = compact_instruction(4000);
        assert!(instruction.contains("4000 characters"));
    }
}
