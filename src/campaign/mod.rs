pub mod types;
pub mod builder;
pub mod events;
pub mod archive;
mod poller;
pub mod tracker;
pub mod dispatcher;
pub mod client;

pub use client::NotifyClient;
pub use events::{ChannelSink, EventSink, NotifyEvent, TracingSink};
