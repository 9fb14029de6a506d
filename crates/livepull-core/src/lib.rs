//! Livepull Core - Low-latency live stream pull client
//!
//! This crate provides the pipeline that turns a pushed live stream into
//! buffered, playable media:
//! - Text control protocol codec
//! - Protocol client with authentication, heartbeat and reconnection
//! - Single-flight remux queue in front of a remuxing engine
//! - Init segment parsing for codec detection
//! - Bounded live buffer with eviction and live-edge steering
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Livepull Core                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Protocol   │  │    Remux     │  │    Buffer    │           │
//! │  │    Client    │─►│    Queue     │─►│  Controller  │           │
//! │  └──────┬───────┘  └──────────────┘  └──────┬───────┘           │
//! │         │                                   │                   │
//! │  ┌──────┴───────┐                    ┌──────┴───────┐           │
//! │  │   Message    │                    │  Init Segment│           │
//! │  │    Codec     │                    │    Parser    │           │
//! │  └──────────────┘                    └──────────────┘           │
//! │                                                                 │
//! │                    ┌─────────────┐                              │
//! │                    │    Pull     │                              │
//! │                    │   Session   │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐                              │
//! │  │  Transport   │  │    Event    │                              │
//! │  │  Connector   │  │     Bus     │                              │
//! │  └──────────────┘  └─────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod message;
pub mod timer;
pub mod client;
pub mod remux;
pub mod mp4;
pub mod media;
pub mod events;
pub mod transport;
pub mod session;

pub use error::{Error, Result};
pub use types::*;
pub use config::ClientConfig;
pub use message::{ControlMessage, MessageKind};
pub use client::{ClientAction, ProtocolClient, SocketId};
pub use remux::{RemuxEngine, RemuxEvent, RemuxQueue};
pub use mp4::{find_box, iter_boxes, parse_init_segment, InitData, TrackInfo, TrackKind};
pub use media::{BufferController, BufferSink, MediaEvent, PlaybackElement};
pub use events::{EventBus, SessionEvent, SessionEventKind, SubscriptionId};
pub use transport::{Connector, MemoryConnector, MemoryServer, SocketEvent, SocketHandle};
pub use session::{PullSession, SessionNotifier};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library
pub fn init() {
    tracing::info!(version = VERSION, "Livepull Core initialized");
}
