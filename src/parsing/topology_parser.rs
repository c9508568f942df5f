use crate::core::{ScalarType, StreamType};
use crate::expression::{BinaryOp, Expr};
use crate::parsing::expression_parser::ExpressionParser;
use crate::parsing::ParseError;
use crate::topology::{JoinTree, JoinTreeNode, TopologyBuilder, TopologyError};
use log::{debug, warn};
use regex::Regex;
use std::collections::BTreeMap;

/// Parser for line-oriented topology declarations:
///
/// ```text
/// -- comment
/// STREAM Location (time INT, x INT, y INT) ORDER BY time
/// STREAM Speed (time_from INT, time_to INT, speed FLOAT, note STRING?) ORDER BY time_from
/// ROOT Location WINDOW 100
/// JOIN Speed ON Location.time = Speed.time_from
/// ```
///
/// Node options are `WINDOW n` (retention), `MAX n` (buffer capacity) and,
/// on the root only, `TUMBLING n` (batch tuples per window of the root's
/// ordering field).
pub struct TopologyParser {
    stream_regex: Regex,
    field_regex: Regex,
    root_regex: Regex,
    join_regex: Regex,
    option_regex: Regex,
    expressions: ExpressionParser,
}

impl TopologyParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(TopologyParser {
            stream_regex: Regex::new(
                r"(?i)^STREAM\s+([A-Za-z_]\w*)\s*\((.*)\)\s*(?:ORDER\s+BY\s+([A-Za-z_]\w*))?\s*$",
            )?,
            field_regex: Regex::new(r"^([A-Za-z_]\w*)\s+([A-Za-z]+)\s*(\?)?$")?,
            root_regex: Regex::new(r"(?i)^ROOT\s+([A-Za-z_]\w*)((?:\s+(?:WINDOW|MAX|TUMBLING)\s+\d+)*)\s*$")?,
            join_regex: Regex::new(
                r"(?i)^JOIN\s+([A-Za-z_]\w*)((?:\s+(?:WINDOW|MAX|TUMBLING)\s+\d+)*)\s+ON\s+(.+)$",
            )?,
            option_regex: Regex::new(r"(?i)(WINDOW|MAX|TUMBLING)\s+(\d+)")?,
            expressions: ExpressionParser::new()?,
        })
    }

    pub fn parse(&self, input: &str) -> Result<JoinTree, ParseError> {
        let mut streams: BTreeMap<String, StreamType> = BTreeMap::new();
        let mut builder: Option<TopologyBuilder> = None;
        let mut root_name = String::new();

        for (index, raw_line) in input.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with("--") || trimmed.starts_with('#') {
                continue;
            }

            if let Some(captures) = self.stream_regex.captures(trimmed) {
                let stream_type = self.parse_stream(line, &captures)?;
                if streams.contains_key(&stream_type.name) {
                    return Err(ParseError::Topology {
                        line,
                        source: TopologyError::DuplicateStream(stream_type.name),
                    });
                }
                debug!("Declared stream {} with {} field(s)", stream_type.name, stream_type.fields.len());
                streams.insert(stream_type.name.clone(), stream_type);
            } else if let Some(captures) = self.root_regex.captures(trimmed) {
                if builder.is_some() {
                    return Err(syntax(line, "ROOT declared twice"));
                }
                let name = &captures[1];
                let node = self.parse_node(line, name, &streams, captures.get(2).map_or("", |m| m.as_str()))?;
                let root = TopologyBuilder::new(node);
                root.clone().build().map_err(|source| ParseError::Topology { line, source })?;
                root_name = name.to_string();
                builder = Some(root);
            } else if let Some(captures) = self.join_regex.captures(trimmed) {
                let current = builder.take().ok_or_else(|| syntax(line, "JOIN before ROOT"))?;
                let name = &captures[1];
                let node = self.parse_node(line, name, &streams, captures.get(2).map_or("", |m| m.as_str()))?;

                let (left_stream, left, right) =
                    self.parse_condition(line, &captures[3], name, &root_name)?;
                let next = current.join_from(&left_stream, node, left, right);
                next.clone().build().map_err(|source| ParseError::Topology { line, source })?;
                builder = Some(next);
            } else {
                return Err(syntax(line, &format!("unrecognized declaration: {}", trimmed)));
            }
        }

        let tree = builder.ok_or(ParseError::MissingRoot)?.build().map_err(|source| {
            ParseError::Topology { line: input.lines().count(), source }
        })?;

        for name in streams.keys() {
            if tree.node_id(name).is_none() {
                warn!("Stream {} is declared but not part of the join tree", name);
            }
        }
        Ok(tree)
    }

    fn parse_stream(&self, line: usize, captures: &regex::Captures) -> Result<StreamType, ParseError> {
        let mut stream_type = StreamType::new(&captures[1]);

        for part in captures[2].split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let field = self
                .field_regex
                .captures(part)
                .ok_or_else(|| syntax(line, &format!("invalid field declaration '{}'", part)))?;
            let ty = ScalarType::from_keyword(&field[2])
                .ok_or_else(|| syntax(line, &format!("unknown type {}", &field[2])))?;
            stream_type = if field.get(3).is_some() {
                stream_type.optional_field(&field[1], ty)
            } else {
                stream_type.field(&field[1], ty)
            };
        }

        if stream_type.fields.is_empty() {
            return Err(syntax(line, "a stream needs at least one field"));
        }
        if let Some(order_field) = captures.get(3) {
            stream_type = stream_type.ordered_by(order_field.as_str());
        }
        Ok(stream_type)
    }

    fn parse_node(
        &self,
        line: usize,
        name: &str,
        streams: &BTreeMap<String, StreamType>,
        options: &str,
    ) -> Result<JoinTreeNode, ParseError> {
        let stream_type = streams
            .get(name)
            .cloned()
            .ok_or_else(|| ParseError::UnknownStream { line, stream: name.to_string() })?;
        let mut node = JoinTreeNode::new(stream_type);

        for option in self.option_regex.captures_iter(options) {
            let value: u64 = option[2]
                .parse()
                .map_err(|_| syntax(line, &format!("{} out of range", &option[2])))?;
            if option[1].eq_ignore_ascii_case("WINDOW") {
                node = node.with_window(value);
            } else if option[1].eq_ignore_ascii_case("TUMBLING") {
                node = node.with_tumbling(value);
            } else {
                let max = usize::try_from(value)
                    .map_err(|_| syntax(line, &format!("{} out of range", value)))?;
                node = node.with_max_entries(max);
            }
        }
        Ok(node)
    }

    /// Split `ON <left> = <right>` into the left stream and both expressions.
    /// A condition written joined-stream first is flipped.
    fn parse_condition(
        &self,
        line: usize,
        condition: &str,
        joined: &str,
        root: &str,
    ) -> Result<(String, Expr, Expr), ParseError> {
        let expr = self.expressions.parse(condition).map_err(|message| syntax(line, &message))?;
        let Expr::Binary { op: BinaryOp::Eq, left, right } = expr else {
            return Err(syntax(line, "join condition must be an equality"));
        };
        let (mut left, mut right) = (*left, *right);

        let mut left_qualifier = single_qualifier(line, &left)?;
        let mut right_qualifier = single_qualifier(line, &right)?;
        if left_qualifier.as_deref() == Some(joined) && right_qualifier.as_deref() != Some(joined) {
            std::mem::swap(&mut left, &mut right);
            std::mem::swap(&mut left_qualifier, &mut right_qualifier);
        }

        let left_stream = left_qualifier.unwrap_or_else(|| root.to_string());
        Ok((left_stream, left, right))
    }
}

fn single_qualifier(line: usize, expr: &Expr) -> Result<Option<String>, ParseError> {
    let mut qualifier: Option<&str> = None;
    for field_ref in expr.field_refs() {
        if let Some(stream) = field_ref.stream.as_deref() {
            match qualifier {
                Some(seen) if seen != stream => {
                    return Err(syntax(
                        line,
                        &format!("expression {} mixes streams {} and {}", expr, seen, stream),
                    ));
                }
                _ => qualifier = Some(stream),
            }
        }
    }
    Ok(qualifier.map(str::to_string))
}

fn syntax(line: usize, message: &str) -> ParseError {
    ParseError::Syntax { line, message: message.to_string() }
}

/// Parse a complete topology declaration.
pub fn parse_topology(input: &str) -> Result<JoinTree, ParseError> {
    TopologyParser::new()?.parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCATION_SPEED: &str = "
        -- robot telemetry
        STREAM Location (time INT, x INT, y INT) ORDER BY time
        STREAM Speed (time_from INT, time_to INT, speed FLOAT, note STRING?) ORDER BY time_from
        ROOT Location WINDOW 100
        JOIN Speed MAX 50 ON Location.time = Speed.time_from
    ";

    #[test]
    fn test_parse_two_stream_topology() {
        let tree = parse_topology(LOCATION_SPEED).unwrap();

        assert_eq!(tree.root().name(), "Location");
        assert_eq!(tree.root().window, Some(100));
        assert_eq!(tree.root().stream_type.order_field.as_deref(), Some("time"));

        let speed = tree.node(tree.node_id("Speed").unwrap());
        assert_eq!(speed.max_entries, Some(50));
        assert!(speed.stream_type.field_def("note").unwrap().optional);

        let pair = &tree.pairs()[0];
        assert_eq!(pair.left_expression, Expr::qualified("Location", "time"));
        assert_eq!(pair.right_expression, Expr::qualified("Speed", "time_from"));
    }

    #[test]
    fn test_flipped_condition_and_chain() {
        let input = "
            STREAM A (k INT)
            STREAM B (k INT, j STRING)
            STREAM C (j STRING)
            ROOT A
            JOIN B ON B.k == A.k
            JOIN C ON B.j = C.j
        ";
        let tree = parse_topology(input).unwrap();

        assert_eq!(tree.pairs()[0].left_expression, Expr::qualified("A", "k"));
        assert_eq!(tree.pairs()[1].left, tree.node_id("B").unwrap());
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let unknown = parse_topology("STREAM A (k INT)\nROOT A\nJOIN B ON k = k").unwrap_err();
        assert_eq!(unknown, ParseError::UnknownStream { line: 3, stream: "B".to_string() });

        let bad_type = parse_topology("STREAM A (k NUMBER)").unwrap_err();
        assert!(matches!(bad_type, ParseError::Syntax { line: 1, .. }));

        let duplicate = parse_topology("STREAM A (k INT)\n# again\nSTREAM A (k INT)").unwrap_err();
        assert_eq!(
            duplicate,
            ParseError::Topology { line: 3, source: TopologyError::DuplicateStream("A".to_string()) }
        );

        let not_equality = parse_topology("STREAM A (k INT)\nSTREAM B (k INT)\nROOT A\nJOIN B ON k < k")
            .unwrap_err();
        assert!(matches!(not_equality, ParseError::Syntax { line: 4, .. }));
    }

    #[test]
    fn test_tumbling_window_option() {
        let tree = parse_topology(
            "STREAM A (t INT) ORDER BY t\nSTREAM B (t INT)\nROOT A TUMBLING 60 WINDOW 600\nJOIN B ON t = t",
        )
        .unwrap();
        assert_eq!(tree.root().tumbling, Some(60));
        assert_eq!(tree.root().window, Some(600));

        let joined = parse_topology(
            "STREAM A (t INT) ORDER BY t\nSTREAM B (t INT) ORDER BY t\nROOT A\nJOIN B TUMBLING 5 ON t = t",
        )
        .unwrap_err();
        assert_eq!(
            joined,
            ParseError::Topology {
                line: 4,
                source: TopologyError::TumblingOnJoinedStream("B".to_string())
            }
        );
    }

    #[test]
    fn test_missing_root() {
        assert_eq!(parse_topology("STREAM A (k INT)").unwrap_err(), ParseError::MissingRoot);
    }
}
