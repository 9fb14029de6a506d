//! CLI command implementations

use anyhow::Context;
use livepull_core::mp4::{iter_boxes, parse_init_segment, BoxType};
use livepull_core::{ClientConfig, ControlMessage};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::output::{print_json, OutputFormat};

/// Boxes whose payload is a sequence of child boxes
const CONTAINER_BOXES: [BoxType; 14] = [
    *b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"mvex", *b"moof", *b"traf", *b"edts",
    *b"dinf", *b"udta", *b"mfra", *b"sinf", *b"schi",
];

/// One node of a printed box tree
#[derive(Debug, Serialize)]
pub struct BoxNode {
    #[serde(rename = "type")]
    pub box_type: String,
    pub offset: usize,
    pub size: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BoxNode>,
}

/// Detect track codecs in an init segment
pub fn codecs(path: &Path, format: &str) -> anyhow::Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    debug!(bytes = data.len(), "Read init segment");
    let init = parse_init_segment(&data)?;
    let mime_type = init.codecs().mime_type();

    if OutputFormat::from(format) == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "file": path.display().to_string(),
            "tracks": init.tracks().collect::<Vec<_>>(),
            "mime_type": mime_type,
        }));
    }

    println!("Init segment: {}", path.display());
    println!("\nTracks:");
    for track in init.tracks() {
        println!(
            "  #{} {:?} - {} @ {}Hz{}",
            track.id,
            track.kind,
            track.codec,
            track.timescale,
            if track.encrypted { " (encrypted)" } else { "" }
        );
        if let Some(defaults) = track.defaults {
            println!(
                "      defaults: duration={} flags=0x{:08x}",
                defaults.sample_duration, defaults.sample_flags
            );
        }
    }
    println!("\nMIME type: {}", mime_type);

    Ok(())
}

/// Print the box tree of a file
pub fn boxes(path: &Path, depth: usize, format: &str) -> anyhow::Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    debug!(bytes = data.len(), depth, "Walking box tree");
    let tree = box_tree(&data, 0, depth);

    if OutputFormat::from(format) == OutputFormat::Json {
        return print_json(&tree);
    }

    println!("{} ({} bytes)", path.display(), data.len());
    print_tree(&tree, 1);
    Ok(())
}

/// Build a box tree, descending into known containers up to `depth` levels
pub fn box_tree(data: &[u8], base: usize, depth: usize) -> Vec<BoxNode> {
    iter_boxes(data)
        .map(|b| {
            let offset = base + b.offset;
            let children = if depth > 0 && CONTAINER_BOXES.contains(&b.box_type) {
                box_tree(b.payload, offset + 8, depth - 1)
            } else {
                Vec::new()
            };
            BoxNode {
                box_type: b.type_str(),
                offset,
                size: b.payload.len() + 8,
                children,
            }
        })
        .collect()
}

fn print_tree(nodes: &[BoxNode], level: usize) {
    for node in nodes {
        println!(
            "{}{} [offset {}, {} bytes]",
            "  ".repeat(level),
            node.box_type,
            node.offset,
            node.size
        );
        print_tree(&node.children, level + 1);
    }
}

/// Encode a control message
pub fn encode_message(msg_type: &str, params: &[String], format: &str) -> anyhow::Result<()> {
    let mut message = ControlMessage::new(msg_type.to_uppercase());
    for param in params {
        let (key, value) = parse_param(param)?;
        message = message.with_param(key, value);
    }

    let raw = message.serialize();
    if OutputFormat::from(format) == OutputFormat::Json {
        return print_json(&message_json(&message, &raw));
    }

    println!("{}", raw);
    Ok(())
}

/// Decode a control message
pub fn decode_message(raw: &str, format: &str) -> anyhow::Result<()> {
    let message = ControlMessage::parse(raw);

    if OutputFormat::from(format) == OutputFormat::Json {
        return print_json(&message_json(&message, raw));
    }

    println!("Type: {} ({:?})", message.msg_type, message.kind());
    if message.parameters.is_empty() {
        println!("Parameters: none");
    } else {
        println!("Parameters:");
        for (key, value) in &message.parameters {
            println!("  {} = {:?}", key, value);
        }
    }

    Ok(())
}

/// Load, validate and resolve a client configuration
pub fn config(path: &Path, format: &str) -> anyhow::Result<()> {
    let config = ClientConfig::from_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;

    if OutputFormat::from(format) == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "config": config,
            "resolved": {
                "max_delay": config.max_delay(),
                "max_buffer_duration": config.max_buffer_duration(),
                "log_filter": config.log_filter(),
            },
        }));
    }

    println!("Config: {} (valid)", path.display());
    println!("  Server: {}", config.server_url);
    println!("  Stream: {}", config.stream_id);
    println!("  Delay: {}s (max {}s)", config.delay, config.max_delay());
    println!("  Max buffer: {}s", config.max_buffer_duration());
    println!(
        "  Queues: {} fragments, {} segments",
        config.max_fragment_queue_length, config.max_segment_queue_length
    );
    match config.max_initial_fragments {
        Some(count) => println!("  Initial fragments: {}", count),
        None => println!("  Initial fragments: server default"),
    }
    println!("  Timeout: {:?}", config.timeout());
    println!("  Heartbeat: {:?}", config.heartbeat_period());
    println!("  Reconnect delay: {:?}", config.reconnect_delay());
    println!("  Log filter: {}", config.log_filter());

    Ok(())
}

fn parse_param(param: &str) -> anyhow::Result<(&str, &str)> {
    match param.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => anyhow::bail!("expected key=value, got {:?}", param),
    }
}

fn message_json(message: &ControlMessage, raw: &str) -> serde_json::Value {
    serde_json::json!({
        "raw": raw,
        "type": message.msg_type,
        "kind": format!("{:?}", message.kind()),
        "parameters": message.parameters,
    })
}
