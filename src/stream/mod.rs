//! Streams: what a client plays and what it publishes.
//!
//! A subscriber stream is a playlist driving a [`PlayEngine`]. The engine
//! serves one item at a time, either pushed from a live [`BroadcastScope`]
//! or pulled on a timer from a recorded [`PullSource`]. Live video goes
//! through a [`VideoFrameDropper`] so a slow client loses whole groups of
//! pictures instead of undecodable frames.
//!
//! A broadcast stream claims a live name and fans its media out to every
//! subscriber of that name.

pub mod broadcast;
pub mod consumer;
pub mod engine;
pub mod frame_dropper;
pub mod message;
pub mod play_item;
pub mod playlist;
pub mod provider;
pub mod service;
pub mod state;

pub use broadcast::{ClientBroadcastStream, PublishMode};
pub use consumer::ConnectionConsumer;
pub use engine::{PlayEngine, PlayEngineConfig, PlayEngineContext};
pub use frame_dropper::{DropperState, VideoFrameDropper};
pub use message::{MessageSink, StreamMessage};
pub use play_item::PlayItem;
pub use playlist::{
    PlaylistController, PlaylistSubscriberStream, PlaylistView, SimplePlaylistController,
};
pub use provider::{
    BroadcastScope, DefaultProviderService, MemoryVodSource, ProviderLookup, ProviderService,
    PullSource,
};
pub use service::{ClientStream, StreamService};
pub use state::{StreamState, StreamStateHolder};
