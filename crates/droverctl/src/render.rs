//! Terminal rendering for droverctl output.

use crate::client::RunSummary;

/// Fixed-width run table.
pub fn render_run_table(runs: &[RunSummary]) -> String {
    if runs.is_empty() {
        return "no runs\n".to_string();
    }

    let mut out = format!(
        "{:<28} {:<10} {:<16} {:<8} {}\n",
        "RUN", "STATUS", "STAGE", "ITEM", "UPDATED"
    );
    for run in runs {
        out.push_str(&format!(
            "{:<28} {:<10} {:<16} {:<8} {}\n",
            run.run_id,
            run.status,
            run.current_stage.as_deref().unwrap_or("-"),
            run.current_item_id.as_deref().unwrap_or("-"),
            short_time(run.updated_at.as_deref()),
        ));
    }
    out
}

fn short_time(value: Option<&str>) -> String {
    let Some(value) = value else {
        return "-".to_string();
    };
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| value.to_string())
}

/// Pretty-print any JSON payload.
pub fn render_json(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table() {
        assert_eq!(render_run_table(&[]), "no runs\n");
    }

    #[test]
    fn table_has_header_and_rows() {
        let runs = vec![RunSummary {
            run_id: "20260801_120000_abcd1234".to_string(),
            status: "running".to_string(),
            current_stage: Some("implement_item".to_string()),
            current_item_id: Some("W002".to_string()),
            updated_at: Some("2026-08-01T12:05:00+00:00".to_string()),
        }];
        let table = render_run_table(&runs);
        assert!(table.starts_with("RUN"));
        assert!(table.contains("20260801_120000_abcd1234"));
        assert!(table.contains("implement_item"));
        assert!(table.contains("W002"));
        assert!(table.contains("2026-08-01 12:05:00"));
    }

    #[test]
    fn short_time_handles_bad_input() {
        assert_eq!(short_time(None), "-");
        assert_eq!(short_time(Some("not a date")), "not a date");
    }
}
