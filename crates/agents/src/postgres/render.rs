//! Tabular answer rendering.
//!
//! Turns a decoded result set into chat-ready text in the tenant's
//! response language: a sentence for scalars, a Markdown table for small
//! sets, a head summary for large ones, always with a source footer.

use super::execute::QueryTable;

/// Rows above this render as a head summary instead of a full table.
const FULL_TABLE_MAX: usize = 20;
/// Rows shown in a head summary.
const HEAD_ROWS: usize = 10;

fn thai(language: &str) -> bool {
    language.eq_ignore_ascii_case("th")
}

/// Renders the final answer text.
pub fn render_answer(
    table: &QueryTable,
    language: &str,
    tables_used: &[String],
    max_rows: u64,
) -> String {
    let th = thai(language);
    let mut out = String::new();

    if table.rows.is_empty() {
        out.push_str(if th {
            "ไม่พบข้อมูลที่ตรงกับคำถามนี้"
        } else {
            "No data matched this question."
        });
    } else if table.is_scalar() {
        let value = &table.rows[0][0];
        let column = &table.columns[0];
        if th {
            out.push_str(&format!("คำตอบคือ **{value}** ({column})"));
        } else {
            out.push_str(&format!("The answer is **{value}** ({column})."));
        }
    } else if table.rows.len() <= FULL_TABLE_MAX {
        out.push_str(&markdown_table(&table.columns, &table.rows));
    } else {
        out.push_str(&markdown_table(&table.columns, &table.rows[..HEAD_ROWS]));
        let remaining = table.rows.len() - HEAD_ROWS;
        if th {
            out.push_str(&format!("\n…และอีก {remaining} แถว (ทั้งหมด {} แถว)", table.rows.len()));
        } else {
            out.push_str(&format!(
                "\n…and {remaining} more rows ({} total)",
                table.rows.len()
            ));
        }
    }

    if table.truncated {
        out.push('\n');
        out.push_str(&if th {
            format!("แสดงผลสูงสุด {max_rows} แถวแรกเท่านั้น")
        } else {
            format!("Results limited to the first {max_rows} rows.")
        });
    }

    out.push_str("\n\n");
    out.push_str(&footer(language, tables_used, table.rows.len()));
    out
}

fn footer(language: &str, tables_used: &[String], rows: usize) -> String {
    let tables = if tables_used.is_empty() {
        "-".to_string()
    } else {
        tables_used.join(", ")
    };
    if thai(language) {
        format!("_ที่มา: ตาราง {tables} · {rows} แถว_")
    } else {
        format!("_Source: tables {tables} · {rows} rows_")
    }
}

fn markdown_table(columns: &[String], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    out.push_str("| ");
    out.push_str(&columns.join(" | "));
    out.push_str(" |\n|");
    for _ in columns {
        out.push_str(" --- |");
    }
    out.push('\n');
    for row in rows {
        out.push_str("| ");
        out.push_str(&row.join(" | "));
        out.push_str(" |\n");
    }
    // trailing newline is dropped so notes attach cleanly
    out.trim_end().to_string()
}

/// A clarifying question for a zero-row result that smells like a
/// misunderstanding (e.g. a filter value outside the data's range).
pub fn render_clarification(language: &str, question: &str) -> String {
    if thai(language) {
        format!(
            "ไม่พบข้อมูลสำหรับ \"{question}\" ช่วยตรวจสอบช่วงวันที่หรือเงื่อนไขอีกครั้ง \
             เช่น ระบุปีหรือชื่อหน่วยงานให้ตรงกับข้อมูลในระบบ"
        )
    } else {
        format!(
            "I found no data for \"{question}\". Could you check the filter values — \
             for example the date range or the exact name — and ask again?"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(cols: &[&str], rows: Vec<Vec<&str>>, truncated: bool) -> QueryTable {
        QueryTable {
            columns: cols.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(|s| s.to_string()).collect())
                .collect(),
            truncated,
        }
    }

    #[test]
    fn scalar_renders_as_sentence() {
        let t = table(&["count"], vec![vec!["42"]], false);
        let text = render_answer(&t, "en", &["employees".to_string()], 500);
        assert!(text.contains("**42**"));
        assert!(text.contains("Source: tables employees"));
    }

    #[test]
    fn scalar_renders_thai() {
        let t = table(&["count"], vec![vec!["42"]], false);
        let text = render_answer(&t, "th", &["employees".to_string()], 500);
        assert!(text.contains("คำตอบคือ **42**"));
        assert!(text.contains("ที่มา"));
    }

    #[test]
    fn small_set_renders_full_markdown_table() {
        let rows: Vec<Vec<&str>> = (0..5).map(|_| vec!["a", "b"]).collect();
        let t = table(&["name", "dept"], rows, false);
        let text = render_answer(&t, "en", &[], 500);
        assert!(text.contains("| name | dept |"));
        assert!(text.contains("| --- | --- |"));
        assert!(!text.contains("more rows"));
    }

    #[test]
    fn large_set_renders_head_summary() {
        let rows: Vec<Vec<&str>> = (0..35).map(|_| vec!["v"]).collect();
        let t = table(&["name"], rows, false);
        let text = render_answer(&t, "en", &[], 500);
        assert!(text.contains("…and 25 more rows (35 total)"));
        // only the head is shown
        assert_eq!(text.matches("| v |").count(), 10);
    }

    #[test]
    fn truncation_note_only_past_cap() {
        let rows: Vec<Vec<&str>> = (0..3).map(|_| vec!["v"]).collect();
        let capped = table(&["name"], rows.clone(), true);
        let text = render_answer(&capped, "en", &[], 500);
        assert!(text.contains("limited to the first 500 rows"));

        let exact = table(&["name"], rows, false);
        let text = render_answer(&exact, "en", &[], 500);
        assert!(!text.contains("limited"));
    }

    #[test]
    fn empty_result_reads_naturally() {
        let t = table(&[], vec![], false);
        let text = render_answer(&t, "en", &["orders".to_string()], 500);
        assert!(text.contains("No data matched"));
        assert!(text.contains("0 rows"));
    }
}
