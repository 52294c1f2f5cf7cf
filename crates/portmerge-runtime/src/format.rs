//! Format parsing.
//!
//! Turns a format description into a [`Selector`] tree.  A format is a list
//! whose elements are either port specifications (strings) or nested lists:
//!
//! ```text
//! format    := "(" element* ")"
//! element   := port-spec | "(" element* ")"
//! port-spec := name ( "[" dimension "]" )*
//! dimension := index-set ( "," index-set )*
//! index-set := integer | integer "-" integer
//! ```
//!
//! Port names are restricted to `[A-Za-z0-9_:/]+`.  Indices are 1-based; a
//! range must not end before it starts.  Whether an index actually exists is
//! only known once data arrives, so bounds are checked at merge time.

use std::str::FromStr;

use portmerge_types::{MergeError, Record, Value};

use crate::selector::{Dimension, IndexSelector, IndexSpec, Selector};

/// Read the text form of a format, e.g. `"(/imu:o[1-3] (/gps:o))"`, and
/// return the contents of its outer list.
///
/// # Errors
///
/// [`MergeError::Syntax`] when the text is not exactly one parenthesised
/// list.
pub fn read_format(text: &str) -> Result<Record, MergeError> {
    let record: Record = text.parse()?;
    let mut values = record.into_values();
    if values.len() == 1
        && let Some(Value::List(root)) = values.pop()
    {
        return Ok(root);
    }
    Err(MergeError::syntax(text.trim(), "format must be a list"))
}

/// Parse the text form of a format straight into a tree.
///
/// # Errors
///
/// See [`read_format`] and [`parse_format`].
pub fn parse_format_text(text: &str) -> Result<Selector, MergeError> {
    parse_format(&read_format(text)?)
}

/// Build a tree from the contents of a format list.
///
/// Strings become leaves, nested lists become composite nodes and the list
/// itself becomes the root.
///
/// # Errors
///
/// [`MergeError::Syntax`] for a malformed port specification or for any
/// element that is neither a string nor a list.  The reason names the
/// dotted 1-based position of the offending element.
pub fn parse_format(format: &Record) -> Result<Selector, MergeError> {
    let mut position = Vec::new();
    Ok(Selector::Root(parse_children(format, &mut position)?))
}

fn parse_children(list: &Record, position: &mut Vec<usize>) -> Result<Vec<Selector>, MergeError> {
    let mut children = Vec::with_capacity(list.len());
    for (i, value) in list.iter().enumerate() {
        position.push(i + 1);
        let child = match value {
            Value::Str(spec) => Selector::Leaf(parse_port_spec(spec)?),
            Value::List(nested) => Selector::Composite(parse_children(nested, position)?),
            other => {
                return Err(MergeError::syntax(
                    other.to_string(),
                    format!(
                        "expected a port name or a list at position {}",
                        dotted(position)
                    ),
                ));
            }
        };
        position.pop();
        children.push(child);
    }
    Ok(children)
}

fn dotted(position: &[usize]) -> String {
    position
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Parse one port specification such as `/foo:o[2,3][1-4]`.
///
/// # Errors
///
/// [`MergeError::Syntax`] carrying the whole specification as its token.
pub fn parse_port_spec(spec: &str) -> Result<IndexSelector, MergeError> {
    let (name, mut rest) = match spec.find('[') {
        Some(open) => spec.split_at(open),
        None => (spec, ""),
    };
    validate_name(spec, name)?;

    let mut path = Vec::new();
    while let Some(body) = rest.strip_prefix('[') {
        let close = body
            .find(']')
            .ok_or_else(|| MergeError::syntax(spec, "Missing closing bracket ']'"))?;
        let group = &body[..close];
        if group.contains('[') {
            return Err(MergeError::syntax(
                spec,
                "Unexpected opening bracket '[' before ']'",
            ));
        }
        path.push(parse_dimension(spec, group)?);
        rest = &body[close + 1..];
    }
    if !rest.is_empty() {
        return Err(MergeError::syntax(
            spec,
            format!("unexpected '{rest}' after index path"),
        ));
    }

    Ok(IndexSelector::new(name, path))
}

impl FromStr for IndexSelector {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_port_spec(s)
    }
}

impl FromStr for Selector {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_format_text(s)
    }
}

fn validate_name(spec: &str, name: &str) -> Result<(), MergeError> {
    if name.is_empty() {
        return Err(MergeError::syntax(spec, "missing port name"));
    }
    match name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '/')))
    {
        Some(c) => Err(MergeError::syntax(
            spec,
            format!("illegal character '{c}' in port name"),
        )),
        None => Ok(()),
    }
}

fn parse_dimension(spec: &str, group: &str) -> Result<Dimension, MergeError> {
    let mut specs = Vec::new();
    for token in group.split(',') {
        let bounds: Vec<&str> = token.split('-').collect();
        let index = match bounds.as_slice() {
            [single] => IndexSpec::Single(parse_index(spec, single)?),
            [start, end] => {
                let (start, end) = (parse_index(spec, start)?, parse_index(spec, end)?);
                if start > end {
                    return Err(MergeError::syntax(
                        spec,
                        format!("End of range before start of range: {token}"),
                    ));
                }
                IndexSpec::Range(start, end)
            }
            _ => {
                return Err(MergeError::syntax(
                    spec,
                    format!("Illegal range specification: {token}"),
                ));
            }
        };
        specs.push(index);
    }
    Ok(Dimension::new(specs))
}

fn parse_index(spec: &str, token: &str) -> Result<u32, MergeError> {
    let invalid = || MergeError::syntax(spec, format!("Could not read integer from '{token}'"));
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    token.parse().map_err(|_| invalid())
}
