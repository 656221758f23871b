//! # moq-source: consume a live MoQ broadcast as raw video frames
//!
//! Connects to a relay, subscribes to a named broadcast, follows its catalog and
//! decodes the video track into packed RGBA frames for a host sink.
//!
//! ## Concepts
//!
//! - **Session**: connection to a relay, owned by [`SessionManager`]
//! - **Origin**: local context under which broadcasts are resolved
//! - **Broadcast**: named stream containing a catalog and tracks
//! - **Catalog**: describes the tracks, delivered again on every change
//! - **Track**: one elementary stream, delivered as [`EncodedFrame`]s
//!
//! ## Async model
//!
//! A [`Transport`] delivers status, catalog and frame events on its own threads.
//! Every event is fenced by the [`Generation`] that was current when the request was
//! made, so a reconnect instantly turns all older events into no-ops.
//!
//! ## Features
//!
//! - `moq`: the production transport on top of `moq-lite`, `hang` and `moq-native`.
//! - `ffmpeg`: the production decoder backend on top of `ac-ffmpeg`.

mod config;
mod consumer;
mod error;
mod fence;
mod handle;
mod id;
mod log;
mod pipeline;
mod session;
mod shutdown;
mod sink;

pub mod codec;
pub mod transport;

pub use config::*;
pub use consumer::*;
pub use error::*;
pub use fence::*;
pub use handle::*;
pub use id::*;
pub use log::*;
pub use pipeline::*;
pub use session::*;
pub use shutdown::*;
pub use sink::*;

pub use codec::{CodecFactory, CodecKind, EncodedFrame, FrameCodec, Picture, PixelFormat, Plane, VideoConfig};
pub use transport::{FrameChunk, OnCatalog, OnFrame, OnStatus, Transport};
