//! Tolerant HTML table extraction.
//!
//! Some "spreadsheet" exports are really HTML documents with one or more
//! `<table>` blocks. Tags are located case-insensitively by scanning within
//! known blocks, cell text is stripped of nested tags, entities are decoded
//! and whitespace is collapsed. Unclosed `<tr>`/`<td>` elements end at the next
//! sibling or at the enclosing block's end.

/// One `<table>` block as rows of cell text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkupTable {
    pub rows: Vec<Vec<String>>,
}

impl MarkupTable {
    pub fn cell_count(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }
}

/// Extracts every table in document order. Tables without rows are skipped.
pub fn extract_tables(html: &str) -> Vec<MarkupTable> {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    let mut tables = Vec::new();
    let mut pos = 0;
    while let Some(start) = find_open(&lower, pos, "table") {
        let body_start = tag_end(&lower, start).unwrap_or(lower.len());
        let end = find_close(&lower, body_start, "table").unwrap_or(lower.len());
        let rows = extract_rows(html, &lower, body_start, end);
        if !rows.is_empty() {
            tables.push(MarkupTable { rows });
        }
        pos = end.max(body_start);
        if pos >= lower.len() {
            break;
        }
    }
    tables
}

/// Index of the table with the most cells; the earliest wins ties.
pub fn largest_table(tables: &[MarkupTable]) -> Option<usize> {
    tables
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, usize)>, (idx, table)| {
            let cells = table.cell_count();
            match best {
                Some((_, best_cells)) if best_cells >= cells => best,
                _ => Some((idx, cells)),
            }
        })
        .map(|(idx, _)| idx)
}

fn extract_rows(html: &str, lower: &str, start: usize, end: usize) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut pos = start;
    while let Some(tr) = find_open(lower, pos, "tr").filter(|&p| p < end) {
        let content_start = tag_end(lower, tr).unwrap_or(end).min(end);
        let next_row = find_open(lower, content_start, "tr")
            .filter(|&p| p < end)
            .unwrap_or(end);
        let row_end = find_close(lower, content_start, "tr")
            .filter(|&p| p < next_row)
            .unwrap_or(next_row);
        let cells = extract_cells(html, lower, content_start, row_end);
        if !cells.is_empty() {
            rows.push(cells);
        }
        pos = row_end.max(content_start);
        if pos >= end {
            break;
        }
    }
    rows
}

fn extract_cells(html: &str, lower: &str, start: usize, end: usize) -> Vec<String> {
    let mut cells = Vec::new();
    let mut pos = start;
    while let Some(open) = next_cell_open(lower, pos).filter(|&p| p < end) {
        let content_start = tag_end(lower, open).unwrap_or(end).min(end);
        let next_open = next_cell_open(lower, content_start)
            .filter(|&p| p < end)
            .unwrap_or(end);
        let close = [
            find_close(lower, content_start, "td"),
            find_close(lower, content_start, "th"),
        ]
        .into_iter()
        .flatten()
        .filter(|&p| p < next_open)
        .min()
        .unwrap_or(next_open);
        cells.push(clean_cell_text(&html[content_start..close]));
        pos = close.max(content_start);
        if pos >= end {
            break;
        }
    }
    cells
}

fn next_cell_open(lower: &str, from: usize) -> Option<usize> {
    [find_open(lower, from, "td"), find_open(lower, from, "th")]
        .into_iter()
        .flatten()
        .min()
}

fn find_open(lower: &str, from: usize, name: &str) -> Option<usize> {
    let needle = format!("<{name}");
    let mut pos = from;
    while let Some(rel) = lower.get(pos..)?.find(&needle) {
        let start = pos + rel;
        let after = start + needle.len();
        match lower.as_bytes().get(after) {
            Some(b) if b.is_ascii_whitespace() || *b == b'>' || *b == b'/' => return Some(start),
            Some(_) => pos = after,
            None => return None,
        }
    }
    None
}

fn find_close(lower: &str, from: usize, name: &str) -> Option<usize> {
    lower
        .get(from..)?
        .find(&format!("</{name}"))
        .map(|rel| from + rel)
}

fn tag_end(lower: &str, start: usize) -> Option<usize> {
    lower.get(start..)?.find('>').map(|rel| start + rel + 1)
}

/// Strips tags, decodes entities and collapses whitespace.
pub fn clean_cell_text(fragment: &str) -> String {
    let mut stripped = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => {
                in_tag = true;
                stripped.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            other => stripped.push(other),
        }
    }
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .filter(|&semi| semi <= 10)
            .and_then(|semi| decode_entity(&tail[1..semi]).map(|ch| (ch, semi)));
        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let numeric = name.strip_prefix('#')?;
            let code = match numeric.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => numeric.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<html><body>
<TABLE><tr><td>עסקאות נדל"ן</td></tr><tr><td>חיפה</td></tr>
<tr><td>מתאריך 27.01.25 עד 28.05.25</td></tr></TABLE>
<table border="1">
  <tr><th>גוש חלקה</th><th>יום מכירה</th><th>ישוב</th></tr>
  <tr><td>028048-0058-010-00</td><td>27/01/2025</td><td><b>חיפה</b></td></tr>
  <tr><td>6650-1-2</td><td>01/02/2025<td>ת&quot;א &amp; יפו
</table></body></html>"#;

    #[test]
    fn extracts_all_tables_in_order() {
        let tables = extract_tables(DOC);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].rows.len(), 3);
        assert_eq!(tables[0].rows[1], vec!["חיפה"]);
        assert_eq!(tables[1].rows[0], vec!["גוש חלקה", "יום מכירה", "ישוב"]);
        assert_eq!(tables[1].rows[1][2], "חיפה");
    }

    #[test]
    fn tolerates_unclosed_cells_and_decodes_entities() {
        let tables = extract_tables(DOC);
        assert_eq!(
            tables[1].rows[2],
            vec!["6650-1-2", "01/02/2025", "ת\"א & יפו"]
        );
    }

    #[test]
    fn largest_table_is_chosen_by_cell_count() {
        let tables = extract_tables(DOC);
        assert_eq!(largest_table(&tables), Some(1));
        assert_eq!(largest_table(&[]), None);
    }

    #[test]
    fn clean_cell_text_collapses_whitespace() {
        assert_eq!(clean_cell_text(" a<br/>b &#1488;&#x5d1; "), "a b אב");
        assert_eq!(clean_cell_text("AT&T"), "AT&T");
    }
}
