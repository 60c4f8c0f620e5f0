//! Text rendering of operation results.

use super::types::{OperationResult, StreamResult, TabularResult};

const FIELD_SEPARATOR: &str = "|";
const HEADER_RULE: char = '=';

/// Render a result as it is written to standard output.
pub fn render(result: &OperationResult) -> String {
    match result {
        OperationResult::Tabular(table) => render_table(table),
        OperationResult::Stream(stream) => render_stream(stream),
    }
}

/// Header, a rule as long as the header, then one line per row.
/// `NULL` cells are empty.
///
/// The rule counts characters, so a non-ASCII header such as `名前` gets two
/// `=` rather than one per UTF-8 byte.
fn render_table(table: &TabularResult) -> String {
    let header = table.columns.join(FIELD_SEPARATOR);
    let rule: String = std::iter::repeat_n(HEADER_RULE, header.chars().count()).collect();

    let mut text = String::with_capacity((header.len() + 1) * (table.rows.len() + 2));
    text.push_str(&header);
    text.push('\n');
    text.push_str(&rule);
    text.push('\n');

    for row in &table.rows {
        let line = row
            .iter()
            .map(|cell| cell.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join(FIELD_SEPARATOR);
        text.push_str(&line);
        text.push('\n');
    }

    text
}

fn render_stream(stream: &StreamResult) -> String {
    String::from_utf8_lossy(&stream.output).into_owned()
}
