//! Fixed-width table parsing for srvrmgr `list` output.
//!
//! Line 1 holds the column names, line 2 a dashed separator whose token
//! lengths give each column's width. The gap between separator tokens is the
//! spacer that follows every column. Remaining lines are data.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::fmt::Write;

/// One data line keyed by column name.
pub type Row = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("command output is not valid ({lines} lines, need header, separator and data)")]
    InvalidOutput { lines: usize },
}

#[derive(Debug, Clone)]
pub struct TabularParser {
    date_format: String,
    /// `date_format` rendered with every digit zeroed; `None` when the format is unusable.
    zero_date: Option<String>,
    substitute_empty: bool,
}

impl TabularParser {
    /// Parser converting values shaped like `date_format` to Unix seconds.
    pub fn new(date_format: &str, disable_empty_override: bool) -> Self {
        let zero_date = zero_template(date_format);
        if zero_date.is_none() {
            tracing::warn!(date_format, "invalid date format, timestamps will not be converted");
        }
        Self {
            date_format: date_format.to_string(),
            zero_date,
            substitute_empty: !disable_empty_override,
        }
    }

    /// Split `lines` into rows; fewer than three lines is invalid output.
    pub fn parse(&self, lines: &[String]) -> Result<Vec<Row>, ParseError> {
        if lines.len() < 3 {
            return Err(ParseError::InvalidOutput { lines: lines.len() });
        }

        let columns: Vec<&str> = lines[0].split_whitespace().collect();
        let separator = lines[1].trim();
        let spacer = spacer_width(separator);
        let widths: Vec<usize> = separator
            .split_whitespace()
            .map(|token| token.len() + spacer)
            .collect();
        tracing::debug!(?columns, ?widths, spacer, "parsed table layout");

        let mut rows = Vec::with_capacity(lines.len() - 2);
        for line in &lines[2..] {
            if line.trim().is_empty() {
                continue;
            }
            rows.push(self.parse_line(line, &columns, &widths));
        }
        tracing::debug!(rows = rows.len(), "parsed data rows");
        Ok(rows)
    }

    fn parse_line(&self, line: &str, columns: &[&str], widths: &[usize]) -> Row {
        let mut rest = line.as_bytes();
        let mut row = Row::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            let Some(&width) = widths.get(index) else {
                tracing::warn!(column = name, "no separator for column");
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let (field, tail) = rest.split_at(width.min(rest.len()));
            rest = tail;
            row.insert(name.to_string(), self.clean_value(field));
        }
        row
    }

    fn clean_value(&self, field: &[u8]) -> String {
        let value = String::from_utf8_lossy(field).trim().to_string();
        if value.is_empty() {
            return if self.substitute_empty {
                "0".to_string()
            } else {
                value
            };
        }
        match &self.zero_date {
            Some(zero) if value.len() == zero.len() => self.to_timestamp(value, zero),
            _ => value,
        }
    }

    /// Unix seconds for a date-shaped value; anything unparsable passes through.
    fn to_timestamp(&self, value: String, zero: &str) -> String {
        if value == zero {
            return "0".to_string();
        }
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&value, &self.date_format) {
            return parsed.and_utc().timestamp().to_string();
        }
        if let Ok(date) = NaiveDate::parse_from_str(&value, &self.date_format) {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return midnight.and_utc().timestamp().to_string();
            }
        }
        value
    }
}

/// Length of the first whitespace run inside a trimmed separator line.
fn spacer_width(separator: &str) -> usize {
    separator
        .find(char::is_whitespace)
        .map(|start| {
            separator[start..]
                .chars()
                .take_while(|c| c.is_whitespace())
                .count()
        })
        .unwrap_or(0)
}

/// The reference datetime rendered with `format`, every digit replaced by `0`.
fn zero_template(format: &str) -> Option<String> {
    let reference = NaiveDate::from_ymd_opt(2006, 1, 2)?.and_hms_opt(15, 4, 5)?;
    let mut rendered = String::new();
    write!(rendered, "{}", reference.format(format)).ok()?;
    Some(
        rendered
            .chars()
            .map(|c| if c.is_ascii_digit() { '0' } else { c })
            .collect(),
    )
}
