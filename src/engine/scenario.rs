// Driftlab Engine — Scenario Synthesis
//
// Generates the customer issues an experiment presents to the agent.
// Issue type is uniform over the five kinds, urgency uniform 1–5, and the
// content comes from a small per-type template pool so retrieval has
// something to bite on. All draws come from the experiment's seeded RNG.

use crate::atoms::types::{Issue, IssueKind};
use rand::Rng;
use std::collections::HashMap;

const REFUND_TEMPLATES: [&str; 3] = [
    "The item I bought is defective and I want my money back. Order ORDER-12345.",
    "I was charged twice for the same order and expect a refund. Order ORDER-98821.",
    "This product is nothing like the description. I'm requesting a refund for ORDER-55210.",
];

const INQUIRY_TEMPLATES: [&str; 3] = [
    "Is this product still in stock? When would it ship if I order today?",
    "Does the deluxe model come with the charging cable included?",
    "What's the difference between the standard and pro versions?",
];

const ORDER_TEMPLATES: [&str; 3] = [
    "Has my order shipped yet? When will it arrive? Order ORDER-33107.",
    "My tracking page hasn't updated in four days. Where is my package?",
    "I need to change the delivery address on my order before it ships.",
];

const COMPLAINT_TEMPLATES: [&str; 3] = [
    "Your service has been terrible and I want to file a complaint.",
    "I've contacted support three times and nobody has solved anything. This is unacceptable.",
    "The courier left my package in the rain and support hung up on me. I'm filing a complaint.",
];

const TECHNICAL_TEMPLATES: [&str; 3] = [
    "I can't log into my account — it keeps saying my password is wrong.",
    "The app crashes every time I open the payment screen.",
    "Two-factor codes never arrive on my phone, so I'm locked out.",
];

fn templates_for(kind: IssueKind) -> &'static [&'static str] {
    match kind {
        IssueKind::RefundRequest => &REFUND_TEMPLATES,
        IssueKind::ProductInquiry => &INQUIRY_TEMPLATES,
        IssueKind::OrderStatus => &ORDER_TEMPLATES,
        IssueKind::Complaint => &COMPLAINT_TEMPLATES,
        IssueKind::TechnicalIssue => &TECHNICAL_TEMPLATES,
    }
}

/// Synthesize the issue for one episode.
pub fn generate_issue<R: Rng>(rng: &mut R, episode: u64) -> Issue {
    let kind = IssueKind::ALL[rng.gen_range(0..IssueKind::ALL.len())];
    let pool = templates_for(kind);
    let content = pool[rng.gen_range(0..pool.len())];

    let mut metadata = HashMap::new();
    if matches!(kind, IssueKind::RefundRequest | IssueKind::OrderStatus) {
        if let Some(order_id) = content
            .split_whitespace()
            .find(|w| w.starts_with("ORDER-"))
            .map(|w| w.trim_end_matches(['.', ',']))
        {
            metadata.insert("order_id".to_string(), order_id.to_string());
        }
    }

    Issue {
        id: uuid::Uuid::new_v4().to_string(),
        ticket_id: format!("TICKET-{episode:06}"),
        customer_id: format!("CUSTOMER-{:05}", rng.gen_range(0..1000)),
        content: content.to_string(),
        kind,
        urgency: rng.gen_range(1..=5),
        metadata,
        created_at: chrono::Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_issue_fields_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for episode in 0..100 {
            let issue = generate_issue(&mut rng, episode);
            assert!((1..=5).contains(&issue.urgency));
            assert!(!issue.content.is_empty());
            assert_eq!(issue.ticket_id, format!("TICKET-{episode:06}"));
        }
    }

    #[test]
    fn test_all_kinds_appear() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut seen = std::collections::HashSet::new();
        for episode in 0..200 {
            seen.insert(generate_issue(&mut rng, episode).kind);
        }
        assert_eq!(seen.len(), IssueKind::ALL.len());
    }

    #[test]
    fn test_refund_issue_carries_order_metadata() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let refund = std::iter::repeat_with(|| generate_issue(&mut rng, 1))
            .find(|i| i.kind == IssueKind::RefundRequest)
            .unwrap();
        let order_id = refund.metadata.get("order_id").unwrap();
        assert!(order_id.starts_with("ORDER-"));
        assert!(!order_id.ends_with('.'));
    }

    #[test]
    fn test_same_seed_same_issues() {
        let mut a = ChaCha8Rng::seed_from_u64(5);
        let mut b = ChaCha8Rng::seed_from_u64(5);
        for episode in 0..50 {
            let ia = generate_issue(&mut a, episode);
            let ib = generate_issue(&mut b, episode);
            assert_eq!(ia.kind, ib.kind);
            assert_eq!(ia.content, ib.content);
            assert_eq!(ia.urgency, ib.urgency);
        }
    }
}
