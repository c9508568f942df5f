use confluence::core::{ScalarType, StreamType};
use confluence::expression::Expr;
use confluence::parsing::{parse_topology, ParseError};
use confluence::topology::{JoinTreeNode, TopologyBuilder, TopologyError};

const ROBOT: &str = "
    # robot telemetry
    STREAM Location (time INT, x INT, y INT) ORDER BY time
    STREAM Speed (time_from INT, time_to INT, speed FLOAT, note STRING?) ORDER BY time_from
    STREAM Accel (time INT, value FLOAT)
    ROOT Location WINDOW 100
    JOIN Speed ON Location.time = Speed.time_from
    JOIN Accel MAX 500 ON Speed.time_to = Accel.time
";

fn build_by_hand() -> confluence::topology::JoinTree {
    let location = StreamType::new("Location")
        .field("time", ScalarType::Int)
        .field("x", ScalarType::Int)
        .field("y", ScalarType::Int)
        .ordered_by("time");
    let speed = StreamType::new("Speed")
        .field("time_from", ScalarType::Int)
        .field("time_to", ScalarType::Int)
        .field("speed", ScalarType::Float)
        .optional_field("note", ScalarType::Str)
        .ordered_by("time_from");
    let accel =
        StreamType::new("Accel").field("time", ScalarType::Int).field("value", ScalarType::Float);

    TopologyBuilder::new(JoinTreeNode::new(location).with_window(100))
        .join(speed, Expr::qualified("Location", "time"), Expr::qualified("Speed", "time_from"))
        .join_from(
            "Speed",
            JoinTreeNode::new(accel).with_max_entries(500),
            Expr::qualified("Speed", "time_to"),
            Expr::qualified("Accel", "time"),
        )
        .build()
        .unwrap()
}

#[test]
fn test_building_twice_gives_equal_trees() {
    let first = build_by_hand();
    let second = build_by_hand();
    assert_eq!(first, second);
    for node in 0..first.nodes().len() {
        assert_eq!(first.traversal_from(node), second.traversal_from(node));
    }

    assert_eq!(parse_topology(ROBOT).unwrap(), parse_topology(ROBOT).unwrap());
}

#[test]
fn test_parsed_topology_equals_builder_topology() {
    assert_eq!(parse_topology(ROBOT).unwrap(), build_by_hand());
}

#[test]
fn test_stream_names_follow_declaration_order() {
    let tree = parse_topology(ROBOT).unwrap();
    assert_eq!(tree.stream_names().collect::<Vec<_>>(), vec!["Location", "Speed", "Accel"]);
    assert_eq!(tree.parent_pair(2), Some(1));
    assert_eq!(tree.pairs()[1].left, 1);
}

#[test]
fn test_structural_errors_surface_from_parser() {
    let cycle = "
        STREAM A (k INT)
        STREAM B (k INT)
        ROOT A
        JOIN B ON A.k = B.k
        JOIN A ON B.k = A.k
    ";
    assert_eq!(
        parse_topology(cycle).unwrap_err(),
        ParseError::Topology { line: 6, source: TopologyError::Cycle("A".to_string()) }
    );

    let incomparable = "
        STREAM A (k INT)
        STREAM B (k STRING)
        ROOT A
        JOIN B ON k = k
    ";
    assert!(matches!(
        parse_topology(incomparable).unwrap_err(),
        ParseError::Topology { line: 5, source: TopologyError::IncomparableKeys { .. } }
    ));

    let zero_window = "STREAM A (k INT)\nROOT A WINDOW 0";
    assert_eq!(
        parse_topology(zero_window).unwrap_err(),
        ParseError::Topology { line: 2, source: TopologyError::ZeroWindow("A".to_string()) }
    );
}

#[test]
fn test_expressions_with_arithmetic_in_conditions() {
    let input = "
        STREAM Reading (sensor STRING, t TIMESTAMP)
        STREAM Calibration (sensor STRING, t TIMESTAMP, offset INT)
        ROOT Reading
        JOIN Calibration ON Reading.sensor || '-' || Reading.t = Calibration.sensor || '-' || Calibration.t
    ";
    assert!(matches!(
        parse_topology(input).unwrap_err(),
        ParseError::Topology { line: 5, .. }
    ));

    let numeric = "
        STREAM Reading (sensor STRING, t TIMESTAMP)
        STREAM Calibration (sensor STRING, t TIMESTAMP, offset INT)
        ROOT Reading
        JOIN Calibration ON Reading.t + 10 = Calibration.t - offset
    ";
    let tree = parse_topology(numeric).unwrap();
    assert_eq!(tree.pairs().len(), 1);
}
