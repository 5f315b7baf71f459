//! Human-readable and JSON rendering of results.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use transfer_scraper::{AccountRegistry, AcquisitionResult, RouterStatus, ScrapedRecord};

/// Longest post excerpt shown in text output.
const EXCERPT_CHARS: usize = 100;

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(EXCERPT_CHARS - 1).collect();
    cut.push('…');
    cut
}

fn record_line(record: &ScrapedRecord) -> String {
    format!(
        "{}  @{:<16} ♥{:<6} ↻{:<5} {}",
        record.created_at.format("%Y-%m-%d %H:%M"),
        record.author.handle,
        record.engagement.likes,
        record.engagement.reposts,
        excerpt(&record.text)
    )
}

pub fn render_result(result: &AcquisitionResult) -> String {
    let mut out = String::new();
    let source = match (result.from_cache, result.stale) {
        (true, true) => format!("{} (stale cache)", result.method),
        (true, false) => format!("{} (cache)", result.method),
        _ => result.method.to_string(),
    };
    let _ = writeln!(
        out,
        "@{}: {} posts via {} in {}ms (rejected {}, confidence {:.2})",
        result.target,
        result.records.len(),
        source,
        result.latency_ms,
        result.rejected,
        result.average_confidence
    );
    for record in &result.records {
        let _ = writeln!(out, "  {}", record_line(record));
    }
    out
}

pub fn render_accounts(registry: &AccountRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<18} {:<22} {:>11} {:>4}", "HANDLE", "NAME", "RELIABILITY", "TIER");
    for account in registry.accounts() {
        let _ = writeln!(
            out,
            "{:<18} {:<22} {:>11.2} {:>4}",
            account.handle, account.display_name, account.reliability, account.tier
        );
    }
    out
}

pub fn render_status(status: &RouterStatus) -> String {
    let mut out = String::new();
    let preferred = status
        .preferred
        .map(|m| m.to_string())
        .unwrap_or_else(|| "none".to_string());
    let _ = writeln!(out, "preferred method: {preferred}");
    for m in &status.methods {
        let _ = writeln!(
            out,
            "  {:<20} success {:>5.1}%  attempts {:<4} drift {:?}{}",
            m.kind.as_str(),
            m.success_rate * 100.0,
            m.attempts,
            m.drift,
            if m.disabled { "  [disabled]" } else { "" }
        );
        if let Some(err) = &m.last_error {
            let _ = writeln!(out, "      last error: {err}");
        }
    }
    let _ = writeln!(
        out,
        "cache: {}/{} entries, hit rate {:.1}%",
        status.cache.entries,
        status.cache.capacity,
        status.cache.hit_rate * 100.0
    );
    out
}

/// Pretty JSON to `path`, or stdout when `None`.
pub fn write_json<T: Serialize>(value: &T, path: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, json + "\n")
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => println!("{json}"),
    }
    Ok(())
}
