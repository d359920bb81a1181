//! Plain-text reports printed by the daemon.

use std::fmt::Write;
use sweeper_engine::{OverallStatistics, TaskOrchestrator, TaskResult, TaskTypeStatistics};
use sweeper_domain::WorldAdapter;

/// One-paragraph report for a finished task
pub fn task_report(result: &TaskResult) -> String {
    let mut out = String::new();
    let status = if result.success { "ok" } else { "FAILED" };
    let _ = writeln!(out, "[{}] {} ({} ms)", status, result.message, result.duration_ms);
    let _ = writeln!(
        out,
        "  processed: {}  failed: {}",
        result.processed_items, result.failed_items
    );
    for (key, value) in &result.statistics {
        let _ = writeln!(out, "  {}: {}", key, value);
    }
    if let Some(error) = &result.error {
        let _ = writeln!(out, "  error: {}", error);
    }
    out
}

/// Aggregate line for the whole run
pub fn overall_report(stats: &OverallStatistics) -> String {
    format!(
        "{} tasks, {} ok, {} failed, {:.1}% success, {:.1} ms average",
        stats.total_tasks,
        stats.successful_tasks,
        stats.failed_tasks,
        stats.success_rate(),
        stats.average_duration_ms()
    )
}

/// One line per task type
pub fn task_type_report(stats: &[TaskTypeStatistics]) -> String {
    let mut out = String::new();
    for entry in stats {
        let _ = writeln!(
            out,
            "  {:<16} runs: {:<4} ok: {:<4} failed: {:<4} objects: {}",
            entry.task_type, entry.count, entry.successes, entry.failures, entry.total_processed
        );
    }
    out
}

/// Everything the engine knows about itself, for the end of a run
pub fn engine_report<W: WorldAdapter>(engine: &TaskOrchestrator<W>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", overall_report(&engine.overall_statistics()));
    out.push_str(&task_type_report(&engine.all_task_type_statistics()));
    let _ = writeln!(out, "{}", engine.performance_summary());
    let _ = writeln!(out, "{}", engine.processing_summary());
    let undo = engine.undo_records();
    if !undo.is_empty() {
        let _ = writeln!(out, "Undoable operations:");
        for record in undo {
            let _ = writeln!(
                out,
                "  {} {} objects, expires {}",
                record.task_id,
                record.object_count,
                record.expires_at.format("%H:%M:%S")
            );
        }
    }
    out
}
