//! Textual form of [`Record`]s.
//!
//! Atoms are separated by whitespace, nested records are parenthesised and
//! strings containing delimiters are double-quoted:
//!
//! ```text
//! 1 2.5 /foo:o[1-3] "two words" (3 (4 5))
//! ```
//!
//! A bare word reads as an integer when it is a valid `i64`, as a float when
//! it looks numeric and is a valid `f64`, and as a string otherwise.  The
//! printer is the inverse, so printing and re-reading yields an equal record.

use std::fmt;
use std::str::FromStr;

use winnow::ascii::{multispace0, take_escaped};
use winnow::combinator::{alt, cut_err, delimited, preceded, repeat, terminated};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{any, literal, none_of, take_while};
use winnow::{ModalResult, Parser};

use crate::MergeError;
use crate::record::{Record, Value};

impl FromStr for Record {
    type Err = MergeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut input = text;
        match terminated(items, multispace0).parse_next(&mut input) {
            Ok(record) if input.is_empty() => Ok(record),
            // Every other leading character starts an item.
            Ok(_) => Err(MergeError::syntax(
                ")",
                format!("unexpected ')' at offset {}", text.len() - input.len()),
            )),
            Err(e) => Err(syntax_error(text, input, &e)),
        }
    }
}

fn syntax_error(text: &str, rest: &str, e: &ErrMode<ContextError>) -> MergeError {
    let offset = text.len() - rest.len();
    let expected = match e {
        ErrMode::Backtrack(inner) | ErrMode::Cut(inner) => inner.context().find_map(|c| match c {
            StrContext::Expected(StrContextValue::Description(what)) => Some(*what),
            _ => None,
        }),
        ErrMode::Incomplete(_) => None,
    };
    let reason = match expected {
        Some(what) => format!("expected {what} at offset {offset}"),
        None => format!("unreadable input at offset {offset}"),
    };
    MergeError::syntax(text.trim(), reason)
}

fn expected(what: &'static str) -> StrContext {
    StrContext::Expected(StrContextValue::Description(what))
}

/// Whitespace-separated values up to the first `)` or the end of input.
fn items(input: &mut &str) -> ModalResult<Record> {
    let values: Vec<Value> = repeat(0.., preceded(multispace0, value)).parse_next(input)?;
    Ok(Record::from(values))
}

fn value(input: &mut &str) -> ModalResult<Value> {
    alt((
        list.map(Value::List),
        quoted.map(Value::Str),
        bare_word.map(read_bare),
    ))
    .parse_next(input)
}

fn list(input: &mut &str) -> ModalResult<Record> {
    delimited(
        literal('('),
        items,
        cut_err(preceded(multispace0, literal(')'))).context(expected("closing ')'")),
    )
    .parse_next(input)
}

fn quoted(input: &mut &str) -> ModalResult<String> {
    preceded(
        literal('"'),
        cut_err(terminated(
            take_escaped(none_of(['\\', '"']), '\\', any),
            literal('"'),
        ))
        .context(expected("closing '\"'")),
    )
    .map(unescape)
    .parse_next(input)
}

fn bare_word<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    take_while(1.., |c: char| !is_delimiter(c)).parse_next(input)
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"')
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn read_bare(word: &str) -> Value {
    if let Ok(i) = word.parse::<i64>() {
        return Value::Int(i);
    }
    let numeric_start = word
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'));
    if numeric_start && let Ok(f) = word.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Str(word.to_string())
}

fn prints_bare(s: &str) -> bool {
    !s.is_empty()
        && !s.chars().any(|c| is_delimiter(c) || c == '\\')
        && matches!(read_bare(s), Value::Str(_))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{x:.1}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) if prints_bare(s) => f.write_str(s),
            Value::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("\"")
            }
            Value::List(record) => write!(f, "({record})"),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn reads_atoms_and_nested_lists() {
        let r: Record = "1 -2 2.5 /foo:o[1-3] (3 (4 five))".parse().unwrap();
        assert_eq!(
            r,
            record![
                1_i64,
                -2_i64,
                2.5,
                "/foo:o[1-3]",
                record![3_i64, record![4_i64, "five"]]
            ]
        );
    }

    #[test]
    fn reads_quoted_strings_with_escapes() {
        let r: Record = r#""two words" "say \"hi\"" "a\\b""#.parse().unwrap();
        assert_eq!(r, record!["two words", "say \"hi\"", "a\\b"]);
    }

    #[test]
    fn parenthesis_delimits_words() {
        let r: Record = "(/a /b)(/c)".parse().unwrap();
        assert_eq!(r, record![record!["/a", "/b"], record!["/c"]]);
    }

    #[test]
    fn unexpected_close_is_a_syntax_error() {
        let err = "/a )".parse::<Record>().unwrap_err();
        assert!(matches!(err, MergeError::Syntax { .. }));
        assert!(err.to_string().contains("unexpected ')'"));
    }

    #[test]
    fn missing_close_is_a_syntax_error() {
        let err = "((/a /b)".parse::<Record>().unwrap_err();
        assert!(matches!(err, MergeError::Syntax { .. }));
        assert!(err.to_string().contains("expected closing ')'"), "{err}");
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        let err = r#"/a "oops"#.parse::<Record>().unwrap_err();
        assert!(err.to_string().contains("expected closing '\"'"), "{err}");
    }

    #[test]
    fn inf_and_nan_words_stay_strings() {
        let r: Record = "inf nan".parse().unwrap();
        assert_eq!(r, record!["inf", "nan"]);
    }

    #[test]
    fn printing_rereads_to_the_same_record() {
        let original = record![
            1_i64,
            3.0,
            0.25,
            "/a[1]",
            "12",
            "",
            "with space",
            record!["q\"uote", record![-7_i64]]
        ];
        let text = original.to_string();
        let back: Record = text.parse().unwrap();
        assert_eq!(back, original, "text form was: {text}");
    }

    #[test]
    fn whole_floats_keep_a_decimal_point() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(record![1_i64, record![2_i64, "x"]].to_string(), "1 (2 x)");
    }
}
