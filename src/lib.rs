#[macro_use]
extern crate tracing;

mod builder;
mod client;
mod handler;
mod listener;
mod recording;
mod resource;
mod runtime;
mod utils;

pub use http;
pub use hyper::body::Bytes;

pub use self::builder::{Builder, ConfigError};
pub use self::client::{RequestError, StartError, Transport};
pub use self::listener::{
    LatencyListener,
    NodeListener,
    RequestListener,
    ResponseTimeListener,
    SnapshotListener,
    TreeListener,
};
pub use self::recording::{IntervalRecorder, IntervalSnapshot, Summary, SummaryLogListener};
pub use self::resource::{Resource, ResourceInfo};
pub use self::runtime::{Error, LoadGenerator, State};
