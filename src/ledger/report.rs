//! Tabular rendering of the ledger.
//!
//! ```text
//! [asset-squeeze] - compress images completed
//! assets/logo.png          ↓40.00%  raster  9.77kB -> 5.86kB
//! assets/icon.svg          ↑20.00%  svg     skipped
//! assets/font.woff2        error    unknown unable to detect file type
//!
//! 19.53kB -> 11.72kB ≈ ↓40.00% reduction
//! total 3, improved 1, skipped 1, failed 1
//! ```

use super::{LedgerRecord, RecordEntry, Summary};

const COLUMN_SPLITTER: &str = "  ";

/// Write the report for `records` line by line into `print`.
///
/// A status header comes first; the totals block only appears when at least
/// one asset improved. An empty ledger prints nothing.
pub fn render_report(records: &[LedgerRecord], summary: &Summary, print: &mut dyn FnMut(&str)) {
    if records.is_empty() {
        return;
    }
    print(&format!(
        "[{}] - compress images {}",
        env!("CARGO_PKG_NAME"),
        summary.status()
    ));

    let rows: Vec<[String; 4]> = records.iter().map(row).collect();

    let mut widths = [0usize; 3];
    for cells in &rows {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.chars().count());
        }
    }

    for cells in &rows {
        let mut line = String::new();
        for (cell, width) in cells.iter().zip(widths) {
            line.push_str(cell);
            line.push_str(&" ".repeat(width - cell.chars().count()));
            line.push_str(COLUMN_SPLITTER);
        }
        line.push_str(&cells[3]);
        print(line.trim_end());
    }

    if summary.improved > 0 {
        print("");
        print(&format!(
            "{}kB -> {}kB ≈ ↓{:.2}% reduction",
            kb(summary.total_before),
            kb(summary.total_after),
            summary.reduction_percent()
        ));
        print(&format!(
            "total {}, improved {}, skipped {}, failed {}",
            summary.total, summary.improved, summary.not_improved, summary.failed
        ));
    }
}

fn row(record: &LedgerRecord) -> [String; 4] {
    let id = record.id.clone();
    match &record.entry {
        RecordEntry::Improved {
            before,
            after,
            compressor,
        } => [
            id,
            format!("↓{:.2}%", rate(*before, *after)),
            compressor.clone(),
            format!("{}kB -> {}kB", kb(*before as u64), kb(*after as u64)),
        ],
        RecordEntry::Skipped {
            before,
            after,
            compressor,
        } => [
            id,
            format!("↑{:.2}%", -rate(*before, *after)),
            compressor.clone(),
            "skipped".to_string(),
        ],
        RecordEntry::Failed {
            compressor,
            message,
        } => [
            id,
            "error".to_string(),
            compressor.clone().unwrap_or_else(|| "unknown".to_string()),
            message.clone(),
        ],
    }
}

/// Reduction rate in percent (negative when the output grew).
fn rate(before: usize, after: usize) -> f64 {
    if before == 0 {
        return 0.0;
    }
    (before as f64 - after as f64) / before as f64 * 100.0
}

fn kb(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / 1024.0)
}
