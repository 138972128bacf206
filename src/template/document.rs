use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Run {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            link: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paragraph {
    pub runs: Vec<Run>,
}

impl Paragraph {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            runs: vec![Run::plain(text)],
        }
    }

    pub fn text(&self) -> String {
        self.runs.iter().map(|run| run.text.as_str()).collect()
    }

    /// Replace every ASCII-case-insensitive occurrence of `needle`.
    ///
    /// With `link` set the replacement span is hyperlinked, otherwise it
    /// keeps the link of the run where the match started. Returns the number
    /// of replacements.
    pub fn replace_all(&mut self, needle: &str, replacement: &str, link: Option<&str>) -> usize {
        if needle.is_empty() {
            return 0;
        }
        let needle = needle.to_ascii_lowercase();
        let mut count = 0;
        let mut from = 0;
        loop {
            let haystack = self.text().to_ascii_lowercase();
            let Some(found) = haystack.get(from..).and_then(|rest| rest.find(&needle)) else {
                break;
            };
            let start = from + found;
            self.splice(start, start + needle.len(), replacement, link);
            from = start + replacement.len();
            count += 1;
        }
        count
    }

    /// Replace the byte range `start..end` of the paragraph text.
    fn splice(&mut self, start: usize, end: usize, replacement: &str, link: Option<&str>) {
        let mut out = Vec::with_capacity(self.runs.len() + 2);
        let mut inserted = false;
        let mut offset = 0;
        let insert = |out: &mut Vec<Run>, inherited: Option<String>| {
            out.push(Run {
                text: replacement.to_string(),
                link: link.map(str::to_string).or(inherited),
            });
        };

        for run in self.runs.drain(..) {
            let (run_start, run_end) = (offset, offset + run.text.len());
            offset = run_end;
            if run_end <= start || run_start >= end {
                if run_start >= end && !inserted {
                    insert(&mut out, None);
                    inserted = true;
                }
                out.push(run);
                continue;
            }
            if run_start < start {
                out.push(Run {
                    text: run.text[..start - run_start].to_string(),
                    link: run.link.clone(),
                });
            }
            if !inserted {
                insert(&mut out, run.link.clone());
                inserted = true;
            }
            if run_end > end {
                out.push(Run {
                    text: run.text[end - run_start..].to_string(),
                    link: run.link.clone(),
                });
            }
        }
        if !inserted {
            insert(&mut out, None);
        }

        // Merge neighbours that ended up with the same link.
        let mut merged: Vec<Run> = Vec::with_capacity(out.len());
        for run in out.into_iter().filter(|run| !run.text.is_empty()) {
            match merged.last_mut() {
                Some(last) if last.link == run.link => last.text.push_str(&run.text),
                _ => merged.push(run),
            }
        }
        self.runs = merged;
    }

    fn to_html(&self) -> String {
        let mut html = String::from("<p>");
        for run in &self.runs {
            match &run.link {
                Some(url) => html.push_str(&format!(
                    "<a href=\"{}\">{}</a>",
                    escape_html(url),
                    escape_html(&run.text)
                )),
                None => html.push_str(&escape_html(&run.text)),
            }
        }
        html.push_str("</p>");
        html
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub cells: Vec<Paragraph>,
}

impl TableRow {
    pub fn from_texts<S: AsRef<str>>(cells: &[S]) -> Self {
        Self {
            cells: cells
                .iter()
                .map(|cell| Paragraph::plain(cell.as_ref()))
                .collect(),
        }
    }

    /// Rewrite every `>` as `{index}>`, turning `<Participant: Name>` into
    /// `<Participant: Name0>`.
    pub fn suffix_markers(&mut self, index: usize) {
        let suffixed = format!("{index}>");
        for run in self.cells.iter_mut().flat_map(|cell| cell.runs.iter_mut()) {
            run.text = run.text.replace('>', &suffixed);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<TableRow>,
}

impl Table {
    pub fn from_rows<S: AsRef<str>>(rows: &[Vec<S>]) -> Self {
        Self {
            rows: rows.iter().map(|row| TableRow::from_texts(row)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Paragraph(Paragraph),
    Table(Table),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub body: Vec<Block>,
}

impl Document {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Build a document from plain text: each line is a paragraph and runs
    /// of `|`-prefixed lines form a table, one row per line.
    pub fn from_text(id: impl Into<String>, name: impl Into<String>, text: &str) -> Self {
        let mut document = Self::new(id, name);
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(row) = trimmed.strip_prefix('|') {
                let row = row.strip_suffix('|').unwrap_or(row);
                let cells: Vec<&str> = row.split('|').map(str::trim).collect();
                let row = TableRow::from_texts(&cells);
                if let Some(Block::Table(table)) = document.body.last_mut() {
                    table.rows.push(row);
                } else {
                    document.body.push(Block::Table(Table { rows: vec![row] }));
                }
            } else {
                document.body.push(Block::Paragraph(Paragraph::plain(line)));
            }
        }
        document
    }

    /// Every paragraph in the body, table cells included.
    pub fn paragraphs_mut(&mut self) -> Vec<&mut Paragraph> {
        let mut paragraphs = Vec::new();
        for block in &mut self.body {
            match block {
                Block::Paragraph(paragraph) => paragraphs.push(paragraph),
                Block::Table(table) => {
                    for row in &mut table.rows {
                        paragraphs.extend(row.cells.iter_mut());
                    }
                }
            }
        }
        paragraphs
    }

    /// Full body text; paragraphs and table cells separated by newlines.
    pub fn text(&self) -> String {
        let mut lines = Vec::new();
        for block in &self.body {
            match block {
                Block::Paragraph(paragraph) => lines.push(paragraph.text()),
                Block::Table(table) => {
                    for row in &table.rows {
                        for cell in &row.cells {
                            lines.push(cell.text());
                        }
                    }
                }
            }
        }
        lines.join("\n")
    }

    pub fn first_table_mut(&mut self) -> Option<&mut Table> {
        self.body.iter_mut().find_map(|block| match block {
            Block::Table(table) => Some(table),
            Block::Paragraph(_) => None,
        })
    }

    /// Index of the first top-level paragraph containing `needle`.
    pub fn find_paragraph(&self, needle: &str) -> Option<usize> {
        self.body.iter().position(|block| match block {
            Block::Paragraph(paragraph) => paragraph.text().contains(needle),
            Block::Table(_) => false,
        })
    }

    /// Replace every occurrence of `needle` in the body. See
    /// [`Paragraph::replace_all`].
    pub fn replace_all(&mut self, needle: &str, replacement: &str, link: Option<&str>) -> usize {
        self.paragraphs_mut()
            .into_iter()
            .map(|paragraph| paragraph.replace_all(needle, replacement, link))
            .sum()
    }

    pub fn to_html(&self) -> String {
        let mut html = String::new();
        for block in &self.body {
            match block {
                Block::Paragraph(paragraph) => html.push_str(&paragraph.to_html()),
                Block::Table(table) => {
                    html.push_str("<table>");
                    for row in &table.rows {
                        html.push_str("<tr>");
                        for cell in &row.cells {
                            html.push_str("<td>");
                            html.push_str(&cell.to_html());
                            html.push_str("</td>");
                        }
                        html.push_str("</tr>");
                    }
                    html.push_str("</table>");
                }
            }
            html.push('\n');
        }
        html
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
