//! Confluence CLI - joins JSON-lines record streams according to a topology file.
//!
//! Usage:
//!   confluence --topology robot.topo --input Location=data/location.jsonl --input Speed=data/speed.jsonl
//!   confluence --topology robot.topo --input Location=loc.jsonl --mqtt Speed=robot/speed --output joined.jsonl

use clap::Parser;
use confluence::parsing::parse_topology;
use confluence::pipeline::{FlattenProcessor, JoinPipeline, PipelineConfig};
use confluence::sinks::{JsonLinesSink, Sink};
use confluence::sources::{FileSource, MqttSource, MqttSourceConfig};
use confluence::Error;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

#[derive(Parser, Debug)]
#[command(name = "confluence")]
#[command(about = "Confluence - Join asynchronous record streams into correlated tuples")]
struct Args {
    /// Topology declaration file
    #[arg(short, long)]
    topology: PathBuf,

    /// JSON-lines input for a stream, as STREAM=PATH (repeatable)
    #[arg(short, long)]
    input: Vec<String>,

    /// MQTT topic feeding a stream, as STREAM=TOPIC (repeatable)
    #[arg(long)]
    mqtt: Vec<String>,

    /// MQTT host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Pipeline configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output file for joined records (stdout when absent)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output file for records that never joined
    #[arg(long)]
    unmatched: Option<PathBuf>,

    /// Name of the output stream
    #[arg(long)]
    output_stream: Option<String>,

    /// End the run after this many idle polls
    #[arg(long)]
    max_idle_polls: Option<u64>,
}

fn split_assignment(raw: &str) -> Result<(&str, &str), Error> {
    raw.split_once('=')
        .map(|(stream, value)| (stream.trim(), value.trim()))
        .filter(|(stream, value)| !stream.is_empty() && !value.is_empty())
        .ok_or_else(|| Error::Config(format!("expected STREAM=VALUE, got '{}'", raw)))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(output_stream) = args.output_stream {
        config.output_stream = output_stream;
    }
    if args.max_idle_polls.is_some() {
        config.max_idle_polls = args.max_idle_polls;
    }

    let tree = parse_topology(&fs::read_to_string(&args.topology)?)?;
    let stream_type = |stream: &str| {
        tree.node_id(stream)
            .map(|id| tree.node(id).stream_type.clone())
            .ok_or_else(|| Error::Config(format!("stream {} is not in the topology", stream)))
    };

    let mut sources: Vec<Box<dyn confluence::sources::StreamSource>> = Vec::new();
    for raw in &args.input {
        let (stream, path) = split_assignment(raw)?;
        sources.push(Box::new(FileSource::open(path, stream_type(stream)?)?));
    }
    for (n, raw) in args.mqtt.iter().enumerate() {
        let (stream, topic) = split_assignment(raw)?;
        let mqtt_config = MqttSourceConfig {
            host: args.mqtt_host.clone(),
            port: args.mqtt_port,
            client_id: format!("confluence_{}_{}", stream, n),
            topic: topic.to_string(),
            ..Default::default()
        };
        sources.push(Box::new(MqttSource::connect(&mqtt_config, stream_type(stream)?)?));
    }

    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let processor = FlattenProcessor::new(&config.output_stream);
    let mut pipeline = JoinPipeline::new(tree, processor, JsonLinesSink::new(writer), config);
    for source in sources {
        pipeline.add_source(source)?;
    }

    let should_stop = pipeline.stop_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping...");
        should_stop.store(true, Ordering::Relaxed);
    })?;

    let report = pipeline.run()?;

    if let Some(path) = &args.unmatched {
        let mut sink = JsonLinesSink::new(BufWriter::new(File::create(path)?));
        for (stream, records) in report.unmatched.clone() {
            for record in records {
                sink.emit(&stream, record)?;
            }
        }
        sink.flush()?;
    }

    let metrics = report.metrics;
    eprintln!("\nConfluence Complete! ({:?})", report.outcome);
    eprintln!("====================");
    eprintln!("Records read:     {}", metrics.records_read);
    eprintln!("Tuples joined:    {} ({:.1}%)", metrics.tuples_joined, metrics.join_rate());
    eprintln!("Records emitted:  {}", metrics.records_emitted);
    eprintln!("Unmatched:        {}", report.unmatched_count());
    eprintln!("Expired:          {}", report.engine.expired);
    eprintln!("Evicted:          {}", report.engine.evicted);
    eprintln!("Eval errors:      {}", report.engine.evaluation_errors);
    eprintln!("Elapsed time:     {:.2}s", metrics.elapsed_seconds);
    eprintln!("Throughput:       {:.1} records/sec", metrics.records_per_second());
    eprintln!("Join throughput:  {:.1} tuples/sec", metrics.tuples_per_second());
    if metrics.windows_processed > 0 {
        eprintln!("Windows:          {}", metrics.windows_processed);
    }
    for stream in pipeline.engine().tree().stream_names() {
        if let Some(stats) = pipeline.engine().buffer_stats(stream) {
            eprintln!(
                "Buffer {:<9} inserted {}, expired {}, evicted {}",
                format!("{}:", stream),
                stats.inserted,
                stats.expired,
                stats.evicted
            );
        }
    }

    Ok(())
}
