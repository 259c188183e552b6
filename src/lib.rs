//! rtmp-push: an async RTMP publishing client
//!
//! This library connects to an RTMP server, performs the handshake and the
//! publishing dialogue (connect / releaseStream / FCPublish / createStream /
//! publish), then multiplexes metadata, H.264 video and AAC audio over the
//! RTMP chunk stream with per-channel back pressure and acknowledgement
//! flow control.
//!
//! The server side of RTMP, the play/subscribe flow and AMF3 are out of
//! scope. TLS is supported by handing a wrapped byte stream to
//! [`RtmpPublisher::connect_with_transport`].
//!
//! # Example
//!
//! ```no_run
//! use rtmp_push::{ClientConfig, MetadataParams, PublisherEvent, RtmpPublisher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("rtmp://a.rtmp.youtube.com/live2/my-stream-key");
//!     let (publisher, mut events) = RtmpPublisher::connect(config).await?;
//!
//!     // Wait until the server accepts the publish
//!     while let Some(event) = events.recv().await {
//!         if let PublisherEvent::StateChanged { state, .. } = event {
//!             println!("state: {}", state);
//!             if state == rtmp_push::ConnectionState::Connected {
//!                 break;
//!             }
//!         }
//!     }
//!
//!     publisher
//!         .send_metadata(MetadataParams {
//!             width: 1280,
//!             height: 720,
//!             framerate: 30.0,
//!             audio_sample_rate: 44100,
//!             audio_sample_size: 16,
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     // send_video_avcc / send_video_frame / send_audio_* follow
//!     publisher.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod client;
pub mod error;
pub mod media;
pub mod protocol;

// Re-export main types for convenience
pub use client::config::{anonymize_uri, ClientConfig, RtmpUri};
pub use client::publisher::{PublisherEvent, RtmpPublisher};
pub use error::{ConnectionState, DisconnectionReason, Error, Result};
pub use media::flv::MetadataParams;
