// Driftlab Engine — Prompt Assembly
//
// Builds the system and user prompts for the agent call: base service
// persona, the selected strategy's hint, retrieved experience summaries
// (few-shot), and the current issue block.

use crate::atoms::types::{Issue, StrategyKind};
use crate::engine::memory::RetrievedMemory;

/// Base persona for the service agent.
pub const AGENT_SYSTEM_PROMPT: &str = "You are a customer service agent for an online retailer. Work principles:\n\
     1. Customers first: aim for a satisfied customer.\n\
     2. Fast response: resolve issues promptly.\n\
     3. Follow policy: operate strictly within company service rules.\n\
     4. Honesty: never make a promise you cannot keep.\n\n\
     Every reply you give is evaluated, and your behavior strategy is \
     adjusted based on how it scores.";

/// Compose the system prompt for one episode.
pub fn compose_system_prompt(strategy: StrategyKind) -> String {
    format!("{}\n\nCurrent strategy: {}", AGENT_SYSTEM_PROMPT, strategy.hint())
}

/// Compose the user prompt: past experience first, then the live issue.
pub fn compose_user_prompt(issue: &Issue, memories: &[RetrievedMemory]) -> String {
    let mut prompt = String::new();

    if !memories.is_empty() {
        prompt.push_str("Relevant past experience (for reference):\n");
        for memory in memories {
            prompt.push_str("- ");
            prompt.push_str(&memory.summary);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    prompt.push_str("Handle this customer issue:\n");
    prompt.push_str(&format!(
        "Ticket: {}\nType: {}\nUrgency: {}/5\nMessage: {}\n\nYour reply:",
        issue.ticket_id,
        issue.kind.as_str(),
        issue.urgency,
        issue.content
    ));

    prompt
}
