//! Renders responses for the terminal

use vmfleet_core::Response;

/// Formats a response as an aligned table with a leading `host` column, or
/// as `host: text` lines when it carries no table. Errors are not included.
pub fn render(resp: &Response) -> String {
    if resp.header.is_empty() {
        return resp
            .response
            .lines()
            .map(|line| format!("{}: {}\n", resp.host, line))
            .collect();
    }

    let mut rows: Vec<Vec<&str>> = Vec::with_capacity(resp.tabular.len() + 1);
    rows.push(
        std::iter::once("host")
            .chain(resp.header.iter().map(String::as_str))
            .collect(),
    );
    for row in &resp.tabular {
        rows.push(
            std::iter::once(resp.host.as_str())
                .chain(row.iter().map(String::as_str))
                .collect(),
        );
    }

    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let widths: Vec<usize> = (0..columns)
        .map(|c| {
            rows.iter()
                .filter_map(|row| row.get(c))
                .map(|cell| cell.chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(c, cell)| format!("{:<width$}", cell, width = widths[c]))
            .collect();
        out.push_str(line.join(" | ").trim_end());
        out.push('\n');
    }
    out
}
