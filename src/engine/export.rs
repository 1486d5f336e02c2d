// Driftlab Engine — Export
//
// Snapshots an experiment's config, statistics, strategy table, and
// (optionally) its full experience log as a structured JSON document or a
// flat CSV. Both formats carry a UTF-8 byte-order-mark for spreadsheet
// tools that need it. Statistics re-import exists for offline analysis
// round-trips; the engine itself persists nothing.

use crate::atoms::config::ExperimentConfig;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Experience, ExperimentStatistics, ExperimentStatus};
use crate::engine::runner::Supervisor;
use crate::engine::strategy::StrategyRecord;
use serde::{Deserialize, Serialize};

/// Byte-order-mark prefixed to every export.
pub const UTF8_BOM: &str = "\u{feff}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub uuid: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub exported_at: String,
    pub config: ExperimentConfig,
    pub statistics: ExperimentStatistics,
    pub strategy_records: Vec<StrategyRecord>,
    /// Present only when the export includes the full experience log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiences: Option<Vec<Experience>>,
}

/// Assemble a snapshot of one experiment.
pub fn snapshot(
    supervisor: &Supervisor,
    uuid: &str,
    include_experiences: bool,
) -> EngineResult<ExperimentSnapshot> {
    let status = supervisor.status(uuid)?;
    Ok(ExperimentSnapshot {
        uuid: status.uuid.clone(),
        name: status.name.clone(),
        status: status.status,
        exported_at: chrono::Utc::now().to_rfc3339(),
        config: supervisor.config(uuid)?,
        statistics: status.statistics,
        strategy_records: supervisor.strategy_records(uuid)?,
        experiences: if include_experiences {
            Some(supervisor.experiences(uuid)?)
        } else {
            None
        },
    })
}

/// Structured document export: BOM + pretty-printed JSON.
pub fn to_json_document(snapshot: &ExperimentSnapshot) -> EngineResult<String> {
    let body = serde_json::to_string_pretty(snapshot)?;
    Ok(format!("{UTF8_BOM}{body}"))
}

/// Parse an exported JSON document back into its statistics.
pub fn import_statistics(document: &str) -> EngineResult<ExperimentStatistics> {
    let body = document.strip_prefix(UTF8_BOM).unwrap_or(document);
    let snapshot: ExperimentSnapshot = serde_json::from_str(body)?;
    Ok(snapshot.statistics)
}

const CSV_HEADER: &str = "episode,ticket_id,issue_kind,urgency,strategy,is_violation,blocked,\
     violation_tags,ticket_closed,response_time_secs,customer_rating,issue_resolved,\
     reward_short,reward_long,reward_violation,reward_total,response";

fn csv_quote(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_row(exp: &Experience) -> String {
    let tags = exp
        .violation_tags
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let (rating, resolved) = match &exp.outcome {
        Some(o) => (o.customer_rating.to_string(), o.issue_resolved.to_string()),
        None => (String::new(), String::new()),
    };
    format!(
        "{},{},{},{},{},{},{},{},{},{:.3},{},{},{:.2},{:.2},{:.2},{:.2},{}",
        exp.episode,
        exp.issue.ticket_id,
        exp.issue.kind.as_str(),
        exp.issue.urgency,
        exp.strategy.as_str(),
        exp.is_violation,
        exp.blocked,
        tags,
        exp.response.ticket_closed,
        exp.response.response_time_secs,
        rating,
        resolved,
        exp.reward.short_term,
        exp.reward.long_term,
        exp.reward.violation,
        exp.reward.total,
        csv_quote(&exp.response.content),
    )
}

/// Flat row-oriented export of the experience log: BOM + header + rows.
pub fn to_csv(snapshot: &ExperimentSnapshot) -> EngineResult<String> {
    let experiences = snapshot.experiences.as_ref().ok_or_else(|| {
        EngineError::Config("CSV export requires the experience log to be included".into())
    })?;

    let mut out = String::with_capacity(experiences.len() * 128 + 256);
    out.push_str(UTF8_BOM);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for exp in experiences {
        out.push_str(&csv_row(exp));
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::*;
    use std::collections::HashMap;

    fn make_snapshot(with_log: bool) -> ExperimentSnapshot {
        let issue = Issue {
            id: "i1".into(),
            ticket_id: "TICKET-000001".into(),
            customer_id: "CUSTOMER-00042".into(),
            content: "I was charged twice, please fix".into(),
            kind: IssueKind::RefundRequest,
            urgency: 4,
            metadata: HashMap::new(),
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        let response = AgentResponse {
            id: "r1".into(),
            issue_id: "i1".into(),
            content: "Let me verify the order, \"one moment\"".into(),
            strategy: StrategyKind::Polite,
            ticket_closed: false,
            response_time_secs: 0.42,
            metadata: HashMap::new(),
            rewritten_from: None,
            created_at: "2026-01-01T00:00:01Z".into(),
        };
        let exp = Experience {
            id: "e1".into(),
            episode: 1,
            issue,
            response,
            outcome: Some(Outcome {
                customer_rating: 5,
                issue_resolved: true,
                has_complaint: false,
                has_follow_up: false,
            }),
            reward: RewardBreakdown {
                short_term: 10.0,
                long_term: 35.0,
                violation: 0.0,
                total: 22.5,
            },
            strategy: StrategyKind::Polite,
            is_violation: false,
            violation_tags: Vec::new(),
            blocked: false,
            created_at: "2026-01-01T00:00:02Z".into(),
        };

        let mut statistics = ExperimentStatistics::default();
        statistics.record(&exp);

        ExperimentSnapshot {
            uuid: "u1".into(),
            name: "export-test".into(),
            status: ExperimentStatus::Completed,
            exported_at: "2026-01-02T00:00:00Z".into(),
            config: crate::atoms::config::ExperimentConfig::default(),
            statistics,
            strategy_records: crate::engine::strategy::StrategyTable::new(0.1)
                .records()
                .to_vec(),
            experiences: if with_log { Some(vec![exp]) } else { None },
        }
    }

    #[test]
    fn test_json_document_has_bom_and_round_trips_statistics() {
        let snap = make_snapshot(false);
        let doc = to_json_document(&snap).unwrap();
        assert!(doc.starts_with(UTF8_BOM));

        let imported = import_statistics(&doc).unwrap();
        let original = serde_json::to_string(&snap.statistics).unwrap();
        let reimported = serde_json::to_string(&imported).unwrap();
        assert_eq!(original, reimported);
    }

    #[test]
    fn test_csv_contains_header_and_quoted_content() {
        let snap = make_snapshot(true);
        let csv = to_csv(&snap).unwrap();
        assert!(csv.starts_with(UTF8_BOM));

        let mut lines = csv.trim_start_matches(UTF8_BOM).lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("episode,ticket_id"));

        let row = lines.next().unwrap();
        assert!(row.starts_with("1,TICKET-000001,refund_request,4,polite,false"));
        // Embedded comma + quotes force CSV quoting with doubled quotes.
        assert!(row.contains("\"Let me verify the order, \"\"one moment\"\"\""));
    }

    #[test]
    fn test_csv_without_log_is_a_config_error() {
        let snap = make_snapshot(false);
        assert!(matches!(to_csv(&snap), Err(EngineError::Config(_))));
    }
}
