//! Plain-text output for the terminal.

use finder_core::audit::AuditReport;
use finder_core::scoring::TagFactor;
use finder_core::selector::Pick;
use finder_core::sync::SyncReport;
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub cached: i64,
    pub highest_id: Option<i64>,
    pub unlabeled: usize,
    pub good: i64,
    pub bad: i64,
    pub dangling_votes: usize,
    pub known_tags: usize,
    pub prior: f64,
}

pub fn sync_summary(report: &SyncReport) -> String {
    let mut out = format!(
        "sync from #{}: {} pages, fetched {}, inserted {}, updated {}, deleted {}",
        report.start_id,
        report.pages,
        report.fetched,
        report.inserted,
        report.updated,
        report.deleted + report.gap_deleted,
    );
    if report.orphans_resolved + report.orphans_forced > 0 {
        let _ = write!(
            out,
            ", orphans resolved {} (forced {})",
            report.orphans_resolved, report.orphans_forced
        );
    }
    if report.orphans_relinked > 0 {
        let _ = write!(out, ", re-linked {}", report.orphans_relinked);
    }
    if let Some(last) = report.last_seen {
        let _ = write!(out, ", last id #{last}");
    }
    out
}

pub fn pick_line(pick: &Pick, base_url: &str) -> String {
    format!(
        "{:<32} {:>10.6}  {:<6}  {}",
        pick.record.to_string(),
        pick.prediction,
        pick.mode.as_str(),
        pick.record.page_url(base_url)
    )
}

pub fn explain_table(prior: f64, factors: &[TagFactor]) -> String {
    let mut out = format!("  {:<30} {:>10.4}\n", "(prior)", prior);
    for f in factors {
        let _ = writeln!(
            out,
            "  {:<30} {:>10.4}  ({}/{} good)",
            f.tag, f.factor, f.good, f.total
        );
    }
    out
}

pub fn stats_table(stats: &Stats) -> String {
    let highest = stats
        .highest_id
        .map_or_else(|| "-".to_string(), |h| format!("#{h}"));
    let mut out = String::new();
    let _ = writeln!(out, "cached posts:    {}", stats.cached);
    let _ = writeln!(out, "highest id:      {highest}");
    let _ = writeln!(out, "unlabeled:       {}", stats.unlabeled);
    let _ = writeln!(out, "good / bad:      {} / {}", stats.good, stats.bad);
    let _ = writeln!(out, "dangling votes:  {}", stats.dangling_votes);
    let _ = writeln!(out, "known tags:      {}", stats.known_tags);
    let _ = writeln!(out, "prior:           {:.4}", stats.prior);
    out
}

pub fn audit_summary(report: &AuditReport) -> String {
    let mut out = String::new();
    for (id, kind) in &report.discrepancies {
        let _ = writeln!(out, "#{id}: {kind:?}");
    }
    let _ = writeln!(
        out,
        "checked {} ids, {} discrepancies",
        report.checked,
        report.discrepancies.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use finder_core::audit::Discrepancy;

    #[test]
    fn sync_summary_mentions_orphans_only_when_present() {
        let mut report = SyncReport {
            start_id: 1,
            pages: 2,
            fetched: 10,
            inserted: 9,
            deleted: 1,
            gap_deleted: 2,
            last_seen: Some(12),
            ..SyncReport::default()
        };
        let line = sync_summary(&report);
        assert!(line.contains("deleted 3"));
        assert!(line.contains("last id #12"));
        assert!(!line.contains("orphans"));

        report.orphans_resolved = 2;
        report.orphans_forced = 1;
        assert!(sync_summary(&report).contains("orphans resolved 2 (forced 1)"));
        report.orphans_relinked = 1;
        assert!(sync_summary(&report).contains("re-linked 1"));
    }

    #[test]
    fn explain_table_starts_with_the_prior() {
        let factors = vec![TagFactor {
            tag: "spiral".into(),
            good: 3,
            total: 4,
            factor: 1.5,
        }];
        let table = explain_table(0.5, &factors);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("(prior)"));
        assert!(lines[1].contains("spiral"));
        assert!(lines[1].contains("(3/4 good)"));
    }

    #[test]
    fn audit_summary_lists_each_discrepancy() {
        let report = AuditReport {
            highest_cached: Some(10),
            checked: 5,
            discrepancies: vec![(3, Discrepancy::Stale), (7, Discrepancy::Missing)],
        };
        let text = audit_summary(&report);
        assert!(text.contains("#3: Stale"));
        assert!(text.contains("#7: Missing"));
        assert!(text.ends_with("checked 5 ids, 2 discrepancies\n"));
    }

    #[test]
    fn stats_table_handles_an_empty_cache() {
        let stats = Stats {
            cached: 0,
            highest_id: None,
            unlabeled: 0,
            good: 0,
            bad: 0,
            dangling_votes: 0,
            known_tags: 0,
            prior: 0.5,
        };
        let table = stats_table(&stats);
        assert!(table.contains("highest id:      -"));
        assert!(table.contains("prior:           0.5000"));
    }
}
