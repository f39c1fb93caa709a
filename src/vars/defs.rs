//! Variable definitions and database file parsing
//!
//! Both files share one line-oriented syntax: `name = value` per line, `#`
//! introduces a comment, blank lines are ignored.
//!
//! Definitions file, one variable per line:
//!
//! ```text
//! # name       = default, persistent, readonly
//! Depth        = 0.0000, 0, 0
//! PID.Depth.p  = 0.0000, 1, 0
//! ClockHz      = 100, 0, 1
//! ```
//!
//! Database file, one persistent variable per line:
//!
//! ```text
//! # VARIABLE           = VALUE
//! PID.Depth.p          = 3.2500
//! ```

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// One parsed variable definition.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDef {
    pub name: String,
    pub default: f64,
    pub persistent: bool,
    pub readonly: bool,
}

/// Split one line into `(name, value)`. Returns None for blank and comment
/// lines.
fn split_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (name, value) = line.split_once('=')?;
    Some((name.trim(), value.trim()))
}

/// Iterate the meaningful `name = value` lines of a file, with 1-based
/// line numbers for error reporting.
fn entries(content: &str) -> impl Iterator<Item = (usize, Option<(&str, &str)>)> {
    content.lines().enumerate().filter_map(|(i, line)| {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            None
        } else {
            Some((i + 1, split_line(line)))
        }
    })
}

fn parse_flag(field: &str, name: &str, what: &str) -> Result<bool> {
    match field.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(Error::Schema(format!(
            "value for {} in variable definition for '{}' should be 0 or 1, got '{}'",
            what, name, other
        ))),
    }
}

/// Parse the variable definitions format.
pub fn parse_defs(content: &str) -> Result<Vec<VarDef>> {
    let mut defs = Vec::new();

    for (line_no, entry) in entries(content) {
        let (name, value) = entry
            .ok_or_else(|| Error::Schema(format!("parse error on line {}", line_no)))?;
        if name.is_empty() {
            return Err(Error::Schema(format!("missing name on line {}", line_no)));
        }

        let mut fields = value.split(',');
        let (default, persistent, readonly) =
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(default), Some(persistent), Some(readonly), None) => {
                    (default, persistent, readonly)
                }
                _ => {
                    return Err(Error::Schema(format!(
                        "format error in variable definition for '{}' (line {})",
                        name, line_no
                    )));
                }
            };

        let default: f64 = default.trim().parse().map_err(|_| {
            Error::Schema(format!(
                "bad default value in variable definition for '{}' (line {})",
                name, line_no
            ))
        })?;

        defs.push(VarDef {
            name: name.to_string(),
            default,
            persistent: parse_flag(persistent, name, "persistent")?,
            readonly: parse_flag(readonly, name, "readonly")?,
        });
    }

    Ok(defs)
}

/// Parse the persistent database format into `(name, value)` pairs.
pub fn parse_db(content: &str) -> Result<Vec<(String, f64)>> {
    let mut values = Vec::new();

    for (line_no, entry) in entries(content) {
        let (name, value) =
            entry.ok_or_else(|| Error::Db(format!("parse error on line {}", line_no)))?;
        let value: f64 = value.trim().parse().map_err(|_| {
            Error::Db(format!(
                "format error in database value for '{}' (line {})",
                name, line_no
            ))
        })?;
        values.push((name.to_string(), value));
    }

    Ok(values)
}

pub fn load_defs<P: AsRef<Path>>(path: P) -> Result<Vec<VarDef>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        Error::Schema(format!(
            "could not open variable definitions file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_defs(&content)
}

pub fn load_db<P: AsRef<Path>>(path: P) -> Result<Vec<(String, f64)>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        Error::Db(format!(
            "could not open variable database {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_db(&content)
}
