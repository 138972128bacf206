use thiserror::Error;

use crate::models::{CellValue, Record, RowHandle};
use crate::store::Sheet;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("header {0:?} not found")]
    HeaderNotFound(String),

    #[error("record has no row handle; cannot update in place")]
    MissingHandle,

    #[error(
        "stale row handle: row {row} of {sheet_id:?} was read at revision {read_revision}, \
         sheet is now {current_sheet:?} at revision {current_revision}"
    )]
    StaleRow {
        sheet_id: String,
        row: usize,
        read_revision: u64,
        current_sheet: String,
        current_revision: u64,
    },
}

/// How header text becomes a record key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeaderCase {
    #[default]
    Camel,
    Verbatim,
}

impl HeaderCase {
    pub fn key(&self, header: &str) -> String {
        match self {
            HeaderCase::Camel => normalize_header(header),
            HeaderCase::Verbatim => header.to_string(),
        }
    }

    fn keys(&self, headers: &[String]) -> Vec<String> {
        headers.iter().map(|header| self.key(header)).collect()
    }
}

/// Normalize header text into a lowerCamelCase key.
///
/// Non-alphanumeric characters are dropped, a space capitalizes the next
/// kept letter, and leading digits are skipped. Blank headers yield `""`,
/// which the mapper treats as an ignored column.
pub fn normalize_header(header: &str) -> String {
    let mut key = String::new();
    let mut upper = false;
    for c in header.chars() {
        if c == ' ' && !key.is_empty() {
            upper = true;
            continue;
        }
        if !c.is_ascii_alphanumeric() {
            continue;
        }
        if key.is_empty() && c.is_ascii_digit() {
            continue;
        }
        if upper {
            upper = false;
            key.push(c.to_ascii_uppercase());
        } else {
            key.push(c.to_ascii_lowercase());
        }
    }
    key
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub headers_row: usize,
    pub include_blanks: bool,
    pub header_case: HeaderCase,
    pub start_header: Option<String>,
    pub end_header: Option<String>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            headers_row: 1,
            include_blanks: false,
            header_case: HeaderCase::Camel,
            start_header: None,
            end_header: None,
        }
    }
}

impl ReadOptions {
    pub fn headers_row(mut self, row: usize) -> Self {
        self.headers_row = row.max(1);
        self
    }

    pub fn include_blanks(mut self) -> Self {
        self.include_blanks = true;
        self
    }
}

/// Read every non-blank row below the header row.
///
/// Each record carries a [`RowHandle`] for later in-place updates. Rows with
/// no populated cell are dropped even when `include_blanks` is set.
pub fn read_records(sheet: &Sheet, options: &ReadOptions) -> Result<Vec<Record>, MapperError> {
    let last_row = sheet.last_row();
    if last_row <= options.headers_row {
        return Ok(Vec::new());
    }

    let headers = sheet.header_row(options.headers_row);
    let (start, end) = column_bounds(
        &headers,
        options.start_header.as_deref(),
        options.end_header.as_deref(),
    )?;
    let keys = options.header_case.keys(&headers[start - 1..end]);

    let mut records = Vec::new();
    for row in options.headers_row + 1..=last_row {
        let mut record = Record::with_handle(RowHandle {
            sheet_id: sheet.id.clone(),
            row,
            revision: sheet.revision(),
        });
        let mut has_data = false;
        for (offset, key) in keys.iter().enumerate() {
            if key.is_empty() {
                continue;
            }
            let value = sheet.cell(row, start + offset);
            if value.is_blank() {
                if options.include_blanks {
                    record.set(key.clone(), CellValue::Text(String::new()));
                }
                continue;
            }
            record.set(key.clone(), value.clone());
            has_data = true;
        }
        if has_data {
            records.push(record);
        }
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
    Clear,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub mode: WriteMode,
    pub headers_row: usize,
    pub first_row: Option<usize>,
    pub header_case: HeaderCase,
    pub start_header: Option<String>,
    pub end_header: Option<String>,
    pub preserve_formulas: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mode: WriteMode::Overwrite,
            headers_row: 1,
            first_row: None,
            header_case: HeaderCase::Camel,
            start_header: None,
            end_header: None,
            preserve_formulas: false,
        }
    }
}

impl WriteOptions {
    pub fn mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn headers_row(mut self, row: usize) -> Self {
        self.headers_row = row.max(1);
        self
    }

    pub fn header_case(mut self, case: HeaderCase) -> Self {
        self.header_case = case;
        self
    }

    pub fn preserve_formulas(mut self) -> Self {
        self.preserve_formulas = true;
        self
    }

    /// Restrict the write to the columns between two headers, inclusive.
    pub fn bounded(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.start_header = Some(start.into());
        self.end_header = Some(end.into());
        self
    }

    /// Restrict the write to a single named column.
    pub fn only(self, header: &str) -> Self {
        self.bounded(header, header)
    }
}

/// The block of cells a write touched, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrittenRange {
    pub first_row: usize,
    pub first_column: usize,
    pub rows: usize,
    pub columns: usize,
}

impl WrittenRange {
    pub fn last_row(&self) -> usize {
        self.first_row + self.rows.saturating_sub(1)
    }
}

/// Write `records` as consecutive rows.
///
/// Returns `Ok(None)` without touching the sheet when `records` is empty.
pub fn write_records(
    sheet: &mut Sheet,
    records: &[Record],
    options: &WriteOptions,
) -> Result<Option<WrittenRange>, MapperError> {
    if records.is_empty() {
        tracing::debug!(sheet = %sheet.name, "no records to write");
        return Ok(None);
    }

    let headers = sheet.header_row(options.headers_row);
    let (start, end) = column_bounds(
        &headers,
        options.start_header.as_deref(),
        options.end_header.as_deref(),
    )?;
    let keys = options.header_case.keys(&headers[start - 1..end]);

    let first_row = options.first_row.unwrap_or(match options.mode {
        WriteMode::Append => sheet.last_row() + 1,
        _ => options.headers_row + 1,
    });

    let formula_columns: Vec<bool> = (start..=end)
        .map(|col| options.preserve_formulas && sheet.formula(options.headers_row, col).is_some())
        .collect();

    for (index, record) in records.iter().enumerate() {
        let row = first_row + index;
        for (offset, key) in keys.iter().enumerate() {
            if formula_columns[offset] {
                continue;
            }
            let value = if key.is_empty() {
                CellValue::Blank
            } else {
                record.get(key).cloned().unwrap_or_default()
            };
            sheet.set_cell(row, start + offset, value);
        }
    }

    let range = WrittenRange {
        first_row,
        first_column: start,
        rows: records.len(),
        columns: keys.len(),
    };
    tracing::debug!(
        sheet = %sheet.name,
        first_row = range.first_row,
        first_column = range.first_column,
        rows = range.rows,
        columns = range.columns,
        "wrote records"
    );

    match options.mode {
        WriteMode::Clear if sheet.last_row() > range.last_row() => {
            tracing::debug!(sheet = %sheet.name, from = range.last_row() + 1, "cleared rows below write");
            sheet.clear_rows_from(range.last_row() + 1);
        }
        WriteMode::Delete if sheet.max_rows() > range.last_row() => {
            tracing::debug!(sheet = %sheet.name, from = range.last_row() + 1, "deleted rows below write");
            sheet.delete_rows_from(range.last_row() + 1);
        }
        _ => {}
    }

    Ok(Some(range))
}

/// Write each record back to the row it was read from.
///
/// `options.first_row` and `options.mode` are ignored; every record must
/// carry a handle that is still valid for `sheet`.
pub fn update_in_place(
    sheet: &mut Sheet,
    records: &[Record],
    options: &WriteOptions,
) -> Result<Vec<WrittenRange>, MapperError> {
    let mut ranges = Vec::with_capacity(records.len());
    for record in records {
        let handle = record.handle().ok_or(MapperError::MissingHandle)?;
        check_handle(sheet, handle)?;
        let row_options = WriteOptions {
            mode: WriteMode::Overwrite,
            first_row: Some(handle.row),
            ..options.clone()
        };
        if let Some(range) = write_records(sheet, std::slice::from_ref(record), &row_options)? {
            ranges.push(range);
        }
    }
    Ok(ranges)
}

pub fn check_handle(sheet: &Sheet, handle: &RowHandle) -> Result<(), MapperError> {
    if handle.sheet_id != sheet.id
        || handle.revision != sheet.revision()
        || handle.row > sheet.max_rows()
    {
        return Err(MapperError::StaleRow {
            sheet_id: handle.sheet_id.clone(),
            row: handle.row,
            read_revision: handle.revision,
            current_sheet: sheet.id.clone(),
            current_revision: sheet.revision(),
        });
    }
    Ok(())
}

/// 1-based inclusive column bounds, optionally pinned to exact header text.
fn column_bounds(
    headers: &[String],
    start_header: Option<&str>,
    end_header: Option<&str>,
) -> Result<(usize, usize), MapperError> {
    let find = |name: &str| {
        headers
            .iter()
            .position(|header| header == name)
            .map(|index| index + 1)
            .ok_or_else(|| MapperError::HeaderNotFound(name.to_string()))
    };
    let start = start_header.map(find).transpose()?.unwrap_or(1);
    let end = end_header.map(find).transpose()?.unwrap_or(headers.len());
    // An inverted pair selects no columns.
    Ok((start, end.max(start - 1)))
}
