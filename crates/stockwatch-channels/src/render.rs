//! Report rendering.
//!
//! A report is first built as a `ReportContent` value; the HTML body and the
//! plain-text body are both rendered from that one value, so they always carry
//! the same facts. Every task- or result-derived string goes through
//! `escape_html` before it lands in markup.

use stockwatch_core::types::{DetailedRow, NotificationRequest};

const COLUMNS: [&str; 6] = ["Item", "Version", "Required", "Available", "Shortage", "Status"];

/// Structured report body.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportContent {
    pub title: String,
    pub task_name: String,
    pub task_id: String,
    pub generated_at: String,
    /// (label, value) pairs shown above the table.
    pub summary: Vec<(String, String)>,
    /// One entry per reported item, in `COLUMNS` order.
    pub rows: Vec<[String; 6]>,
    pub warnings: Vec<String>,
}

impl ReportContent {
    /// Build the report for one notification request.
    pub fn from_request(request: &NotificationRequest) -> Self {
        let result = &request.result;
        let summary = vec![
            ("Items checked".to_string(), result.summary.total_items.to_string()),
            ("In shortage".to_string(), result.summary.items_in_shortage.to_string()),
            ("Critical".to_string(), result.summary.critical_items.to_string()),
            ("Notify on".to_string(), request.task.notify_condition.to_string()),
        ];

        let mut reported: Vec<&DetailedRow> = result
            .detailed_rows
            .iter()
            .filter(|r| r.in_shortage() || r.critical)
            .collect();
        reported.sort_by(|a, b| b.critical.cmp(&a.critical).then(a.item_name.cmp(&b.item_name)));

        let rows = reported
            .into_iter()
            .map(|r| {
                [
                    r.item_name.clone(),
                    r.version.clone().unwrap_or_else(|| "-".to_string()),
                    format_quantity(r.required),
                    format_quantity(r.available),
                    format_quantity(r.shortage),
                    status_label(r).to_string(),
                ]
            })
            .collect();

        Self {
            title: format!("Shortage report: {}", request.task.name),
            task_name: request.task.name.clone(),
            task_id: request.task.id.clone(),
            generated_at: request.generated_at.format("%Y-%m-%d %H:%M UTC").to_string(),
            summary,
            rows,
            warnings: result.warnings.clone(),
        }
    }

    /// HTML body. All dynamic text is escaped.
    pub fn render_html(&self) -> String {
        let mut html = String::with_capacity(2048);
        html.push_str("<!DOCTYPE html>\n<html><body style=\"font-family: sans-serif;\">\n");
        html.push_str(&format!("<h2>{}</h2>\n", escape_html(&self.title)));
        html.push_str(&format!(
            "<p>Task <strong>{}</strong> ({}) checked at {}.</p>\n",
            escape_html(&self.task_name),
            escape_html(&self.task_id),
            escape_html(&self.generated_at)
        ));

        html.push_str("<ul>\n");
        for (label, value) in &self.summary {
            html.push_str(&format!(
                "<li>{}: <strong>{}</strong></li>\n",
                escape_html(label),
                escape_html(value)
            ));
        }
        html.push_str("</ul>\n");

        if self.rows.is_empty() {
            html.push_str("<p>All items are available.</p>\n");
        } else {
            html.push_str("<table border=\"1\" cellpadding=\"4\" cellspacing=\"0\">\n<tr>");
            for col in COLUMNS {
                html.push_str(&format!("<th>{col}</th>"));
            }
            html.push_str("</tr>\n");
            for row in &self.rows {
                html.push_str("<tr>");
                for cell in row {
                    html.push_str(&format!("<td>{}</td>", escape_html(cell)));
                }
                html.push_str("</tr>\n");
            }
            html.push_str("</table>\n");
        }

        if !self.warnings.is_empty() {
            html.push_str("<h3>Warnings</h3>\n<ul>\n");
            for warning in &self.warnings {
                html.push_str(&format!("<li>{}</li>\n", escape_html(warning)));
            }
            html.push_str("</ul>\n");
        }

        html.push_str("</body></html>\n");
        html
    }

    /// Plain-text body with the same information as the HTML body.
    pub fn render_text(&self) -> String {
        let mut text = String::with_capacity(1024);
        text.push_str(&self.title);
        text.push('\n');
        text.push_str(&"=".repeat(self.title.chars().count()));
        text.push_str(&format!(
            "\n\nTask {} ({}) checked at {}.\n\n",
            self.task_name, self.task_id, self.generated_at
        ));

        for (label, value) in &self.summary {
            text.push_str(&format!("- {label}: {value}\n"));
        }
        text.push('\n');

        if self.rows.is_empty() {
            text.push_str("All items are available.\n");
        } else {
            let mut widths = COLUMNS.map(|c| c.chars().count());
            for row in &self.rows {
                for (i, cell) in row.iter().enumerate() {
                    widths[i] = widths[i].max(cell.chars().count());
                }
            }
            let header: Vec<String> = COLUMNS.iter().map(|c| c.to_string()).collect();
            text.push_str(&format_text_row(&header, &widths));
            text.push_str(&format_text_row(
                &widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>(),
                &widths,
            ));
            for row in &self.rows {
                text.push_str(&format_text_row(row, &widths));
            }
        }

        if !self.warnings.is_empty() {
            text.push_str("\nWarnings:\n");
            for warning in &self.warnings {
                text.push_str(&format!("- {warning}\n"));
            }
        }
        text
    }
}

fn format_text_row(cells: &[String], widths: &[usize; 6]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths.iter())
        .map(|(cell, w)| format!("{cell:<w$}", w = *w))
        .collect();
    format!("{}\n", padded.join("  ").trim_end())
}

fn status_label(row: &DetailedRow) -> &'static str {
    match (row.critical, row.in_shortage()) {
        (true, _) => "CRITICAL",
        (false, true) => "SHORTAGE",
        (false, false) => "OK",
    }
}

/// Whole numbers without decimals, everything else with two.
pub fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

/// Escape text for embedding in HTML element content or attribute values.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
