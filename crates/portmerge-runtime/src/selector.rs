//! Selector tree.
//!
//! A parsed format is a tree of [`Selector`] nodes which is replayed once per
//! merge tick against the cached source records.
//!
//! | Node | Contribution to the output |
//! |---|---|
//! | [`Selector::Leaf`] | elements picked from one source by its index path, spliced in |
//! | [`Selector::Composite`] | one new nested record holding its children's contributions |
//! | [`Selector::Root`] | its children's contributions, with no extra nesting |
//!
//! # Example
//!
//! ```rust
//! use portmerge_runtime::format::parse_format_text;
//!
//! let tree = parse_format_text("(/imu:o[1-3] (/joints:o[2][1,3]))").unwrap();
//! assert_eq!(tree.source_names(), vec!["/imu:o", "/joints:o"]);
//! assert_eq!(tree.to_string(), "(\n  /imu:o[1-3]\n  (\n    /joints:o[2][1,3]\n  )\n)\n");
//! ```

use std::fmt;
use std::ops::RangeInclusive;

use portmerge_types::{MergeError, Record, Value};

use crate::sources::SourceRegistry;

// ─────────────────────────────────────────────────────────────────────────────
// Index paths
// ─────────────────────────────────────────────────────────────────────────────

/// One comma-separated token inside a bracket group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSpec {
    /// A single 1-based index.
    Single(u32),
    /// An inclusive 1-based range; `start <= end` is checked at parse time.
    Range(u32, u32),
}

impl IndexSpec {
    fn members(self) -> RangeInclusive<u32> {
        match self {
            IndexSpec::Single(i) => i..=i,
            IndexSpec::Range(start, end) => start..=end,
        }
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSpec::Single(i) => write!(f, "{i}"),
            IndexSpec::Range(start, end) => write!(f, "{start}-{end}"),
        }
    }
}

/// The index set applied at one level of nesting: one bracket group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    specs: Vec<IndexSpec>,
}

impl Dimension {
    pub fn new(specs: Vec<IndexSpec>) -> Self {
        Self { specs }
    }

    /// Member indices in parse order; ranges ascend, duplicates are kept.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.specs.iter().flat_map(|spec| spec.members())
    }

    pub fn specs(&self) -> &[IndexSpec] {
        &self.specs
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, spec) in self.specs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{spec}")?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IndexSelector
// ─────────────────────────────────────────────────────────────────────────────

/// Picks elements from one source by an index path.
///
/// With an empty path the whole cached record is spliced into the output.
/// Otherwise each dimension selects from the record reached by the previous
/// one; on the last dimension a nested element is unwrapped one level and a
/// scalar is appended as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSelector {
    name: String,
    path: Vec<Dimension>,
}

impl IndexSelector {
    pub fn new(name: impl Into<String>, path: Vec<Dimension>) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }

    /// The source name this selector reads from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &[Dimension] {
        &self.path
    }

    fn select(&self, out: &mut Record, sources: &SourceRegistry) -> Result<(), MergeError> {
        match sources.get(&self.name)? {
            Some(record) => self.select_from(out, record, &self.path),
            // Nothing received yet.
            None => Ok(()),
        }
    }

    fn select_from(
        &self,
        out: &mut Record,
        input: &Record,
        dims: &[Dimension],
    ) -> Result<(), MergeError> {
        let Some((dim, rest)) = dims.split_first() else {
            out.extend_from(input);
            return Ok(());
        };

        for index in dim.indices() {
            let value = index
                .checked_sub(1)
                .and_then(|i| input.get(i as usize))
                .ok_or_else(|| MergeError::IndexRange {
                    port: self.name.clone(),
                    index,
                    len: input.len(),
                })?;

            match (value, rest.is_empty()) {
                (Value::List(nested), true) => out.extend_from(nested),
                (scalar, true) => out.push(scalar.clone()),
                (Value::List(nested), false) => self.select_from(out, nested, rest)?,
                (_, false) => {
                    return Err(MergeError::IndexType {
                        port: self.name.clone(),
                        index,
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for IndexSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for dim in &self.path {
            write!(f, "[{dim}]")?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Selector
// ─────────────────────────────────────────────────────────────────────────────

/// A node in a parsed format tree.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Leaf(IndexSelector),
    /// Wraps its children's output in one new nested record.
    Composite(Vec<Selector>),
    /// Top of the tree: children write straight into the output record.
    Root(Vec<Selector>),
}

impl Selector {
    /// Child nodes; empty for a leaf.
    pub fn children(&self) -> &[Selector] {
        match self {
            Selector::Leaf(_) => &[],
            Selector::Composite(children) | Selector::Root(children) => children,
        }
    }

    /// `true` for a group without children.
    pub fn is_empty(&self) -> bool {
        !matches!(self, Selector::Leaf(_)) && self.children().is_empty()
    }

    /// Every source name referenced below this node, in first-use order and
    /// without duplicates.
    pub fn source_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Selector::Leaf(leaf) => {
                if !names.contains(&leaf.name()) {
                    names.push(leaf.name());
                }
            }
            Selector::Composite(children) | Selector::Root(children) => {
                for child in children {
                    child.collect_names(names);
                }
            }
        }
    }

    /// Append this node's contribution to `out`, reading cached records from
    /// `sources`.
    ///
    /// # Errors
    ///
    /// [`MergeError::IndexRange`] / [`MergeError::IndexType`] when a record
    /// does not have the shape the index path expects, and
    /// [`MergeError::Lookup`] if a source was never declared.  `out` may hold
    /// a partial result after an error.
    pub fn select(&self, out: &mut Record, sources: &SourceRegistry) -> Result<(), MergeError> {
        match self {
            Selector::Leaf(leaf) => leaf.select(out, sources),
            Selector::Composite(children) => {
                let nested = out.add_list();
                for child in children {
                    child.select(nested, sources)?;
                }
                Ok(())
            }
            Selector::Root(children) => {
                for child in children {
                    child.select(out, sources)?;
                }
                Ok(())
            }
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            // Quoted when the bare text would read back as a number.
            Selector::Leaf(leaf) => writeln!(f, "{:indent$}{}", "", Value::Str(leaf.to_string())),
            Selector::Composite(children) | Selector::Root(children) => {
                writeln!(f, "{:indent$}(", "")?;
                for child in children {
                    child.write_indented(f, indent + 2)?;
                }
                writeln!(f, "{:indent$})", "")
            }
        }
    }
}

/// Indented dump: groups print `(` / `)` around their children, leaves print
/// `name[i,j][a-b]...`.  The text parses back into an equal tree.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{parse_format_text, parse_port_spec};
    use portmerge_middleware::{OutputChannel, PortBus, Transport};
    use portmerge_types::record;
    use std::sync::Arc;
    use std::time::Duration;

    /// A registry over an in-process bus with each `(name, record)` pair
    /// published once and refreshed into the cache.
    async fn sources_with(
        data: &[(&str, Record)],
    ) -> Result<(SourceRegistry, Vec<Box<dyn OutputChannel>>), MergeError> {
        let bus = PortBus::default();
        let transport: Arc<dyn Transport> = Arc::new(bus.clone());
        let mut sources = SourceRegistry::new(transport, "/test/source", Duration::from_secs(1));
        let mut producers = Vec::new();
        for (name, _) in data {
            producers.push(bus.open_output(name).await?);
            sources.declare(name).await?;
        }
        for ((_, record), producer) in data.iter().zip(producers.iter_mut()) {
            producer.write(record)?;
        }
        sources.refresh_all();
        Ok((sources, producers))
    }

    fn leaf(spec: &str) -> Selector {
        Selector::Leaf(parse_port_spec(spec).unwrap())
    }

    async fn eval(spec: &str, data: Record) -> Result<Record, MergeError> {
        let selector = leaf(spec);
        let name = selector.source_names()[0].to_string();
        let (sources, _producers) = sources_with(&[(name.as_str(), data)]).await?;
        let mut out = Record::new();
        selector.select(&mut out, &sources)?;
        Ok(out)
    }

    #[tokio::test]
    async fn empty_path_splices_whole_record() {
        let out = eval("/a/b", record![1_i64, 2_i64, 3_i64]).await.unwrap();
        assert_eq!(out, record![1_i64, 2_i64, 3_i64]);
    }

    #[tokio::test]
    async fn single_index_is_one_based() {
        let out = eval("/a[1]", record![10_i64, 20_i64, 30_i64]).await.unwrap();
        assert_eq!(out, record![10_i64]);
    }

    #[tokio::test]
    async fn range_is_inclusive() {
        let out = eval("/a[1-2]", record![10_i64, 20_i64, 30_i64]).await.unwrap();
        assert_eq!(out, record![10_i64, 20_i64]);
    }

    #[tokio::test]
    async fn second_dimension_indexes_nested_record() {
        let data = record![record![10_i64, 11_i64], record![20_i64, 21_i64]];
        let out = eval("/a[1][2]", data).await.unwrap();
        assert_eq!(out, record![11_i64]);
    }

    #[tokio::test]
    async fn every_index_of_every_dimension_is_visited() {
        let data = record![
            record![10_i64, 11_i64, 12_i64],
            record![20_i64, 21_i64, 22_i64]
        ];
        let out = eval("/a[2,1][3,1]", data).await.unwrap();
        assert_eq!(out, record![22_i64, 20_i64, 12_i64, 10_i64]);
    }

    #[tokio::test]
    async fn duplicates_are_preserved() {
        let out = eval("/a[2,2,1-2]", record!["x", "y"]).await.unwrap();
        assert_eq!(out, record!["y", "y", "x", "y"]);
    }

    #[tokio::test]
    async fn last_dimension_unwraps_nested_element_once() {
        let data = record![record![1_i64, record![2_i64, 3_i64]], 4_i64];
        let out = eval("/a[1,2]", data).await.unwrap();
        assert_eq!(out, record![1_i64, record![2_i64, 3_i64], 4_i64]);
    }

    #[tokio::test]
    async fn indexing_a_scalar_fails() {
        let err = eval("/a[1][1]", record![5_i64, 6_i64]).await.unwrap_err();
        assert_eq!(
            err,
            MergeError::IndexType {
                port: "/a".to_string(),
                index: 1
            }
        );
    }

    #[tokio::test]
    async fn out_of_range_index_fails() {
        let err = eval("/a[5]", record![1_i64, 2_i64, 3_i64]).await.unwrap_err();
        assert_eq!(
            err,
            MergeError::IndexRange {
                port: "/a".to_string(),
                index: 5,
                len: 3
            }
        );
    }

    #[tokio::test]
    async fn index_zero_is_out_of_range() {
        let err = eval("/a[0]", record![1_i64]).await.unwrap_err();
        assert!(matches!(err, MergeError::IndexRange { index: 0, .. }));
    }

    #[tokio::test]
    async fn source_without_data_contributes_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let bus = PortBus::default();
        let _producer = bus.open_output("/quiet:o").await?;
        let transport: Arc<dyn Transport> = Arc::new(bus);
        let mut sources = SourceRegistry::new(transport, "/test/source", Duration::from_secs(1));
        sources.declare("/quiet:o").await?;
        sources.refresh_all();

        let tree = parse_format_text("(/quiet:o /quiet:o[3][2] (/quiet:o))")?;
        let mut out = Record::new();
        tree.select(&mut out, &sources)?;
        assert_eq!(out, record![record![]]);
        Ok(())
    }

    #[tokio::test]
    async fn composite_wraps_and_root_does_not() -> Result<(), Box<dyn std::error::Error>> {
        let (sources, _producers) = sources_with(&[
            ("/a", record![1_i64, 2_i64]),
            ("/b", record!["x"]),
        ])
        .await?;

        let flat = parse_format_text("(/a /b)")?;
        let mut out = Record::new();
        flat.select(&mut out, &sources)?;
        assert_eq!(out, record![1_i64, 2_i64, "x"]);

        let grouped = parse_format_text("((/a /b) /b)")?;
        let mut out = Record::new();
        grouped.select(&mut out, &sources)?;
        assert_eq!(out, record![record![1_i64, 2_i64, "x"], "x"]);
        Ok(())
    }

    #[tokio::test]
    async fn undeclared_source_is_a_lookup_error() -> Result<(), Box<dyn std::error::Error>> {
        let (sources, _producers) = sources_with(&[("/a", record![1_i64])]).await?;
        let mut out = Record::new();
        let err = leaf("/never").select(&mut out, &sources).unwrap_err();
        assert_eq!(err, MergeError::Lookup("/never".to_string()));
        Ok(())
    }

    #[test]
    fn source_names_are_deduplicated_in_first_use_order() {
        let tree = parse_format_text("(/b (/a /b[1]) /c /a)").unwrap();
        assert_eq!(tree.source_names(), vec!["/b", "/a", "/c"]);
    }

    #[test]
    fn display_prints_ranges_and_nesting() {
        let tree = parse_format_text("(/foo:o[3,1] /bar:o[2,3][1-4] (/baz:o))").unwrap();
        let expected = "(\n  /foo:o[3,1]\n  /bar:o[2,3][1-4]\n  (\n    /baz:o\n  )\n)\n";
        assert_eq!(tree.to_string(), expected);
    }

    #[test]
    fn display_reparses_to_an_equal_tree() {
        for text in [
            "(/a)",
            "(/a[1][2-3,5] (/b (/c[7])) ())",
            "((/x:o) (/y:o[1,1,1]))",
            r#"("12" "1e5" "12[1]" ("7"))"#,
        ] {
            let tree = parse_format_text(text).unwrap();
            let again = parse_format_text(&tree.to_string()).unwrap();
            assert_eq!(again, tree, "round trip of {text}");
        }
    }

    #[test]
    fn numeric_looking_names_print_quoted() {
        let tree = parse_format_text(r#"("12" "1e5" /a[1])"#).unwrap();
        assert_eq!(tree.to_string(), "(\n  \"12\"\n  \"1e5\"\n  /a[1]\n)\n");
    }

    #[test]
    fn empty_groups_are_empty() {
        assert!(parse_format_text("()").unwrap().is_empty());
        assert!(!parse_format_text("(())").unwrap().is_empty());
        assert!(!leaf("/a").is_empty());
    }
}
