//! RTMP publishing client
//!
//! [`config`] holds the connection parameters and URI handling;
//! [`publisher`] drives the connection and exposes the send API.

pub mod config;
pub mod publisher;

pub use config::{anonymize_uri, ClientConfig, RtmpUri};
pub use publisher::{PublisherEvent, RtmpPublisher};
