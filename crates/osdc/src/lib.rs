//! OSD request dispatch engine.
//!
//! Client access to a distributed object-storage cluster: file extents are
//! mapped onto fixed-size objects, each object operation is dispatched to the
//! primary OSD for its placement group, and pending requests are tracked so
//! they can be resubmitted when the cluster map changes or a transport
//! channel resets.
//!
//! # Architecture
//!
//! - [`OsdClient`]: public surface (`readpages`, `writepages`, `sync`) plus
//!   the delivery callbacks the transport invokes (`handle_reply`,
//!   `handle_map`, `handle_reset`, `prepare_pages`)
//! - [`request::OsdRequest`]: per-request state machine with reply and
//!   on-disk completion signals
//! - [`session::OsdSession`]: per-OSD connection with its attached requests
//! - Message encoding/decoding for OSD op and op-reply fronts
//! - A minimal [`osdmap::OsdMap`] realizing the placement interface

pub mod client;
pub mod error;
pub mod layout;
pub mod messages;
pub mod monc;
pub mod osdmap;
pub mod request;
pub mod session;
pub mod types;

pub use client::{OsdClient, OsdClientConfig};
pub use error::OsdcError;
pub use layout::{file_extent_to_object, ObjectExtent};
pub use monc::MonitorClient;
pub use osdmap::{OsdMap, OsdMapIncremental};
pub use request::OsdRequest;
pub use types::{FileLayout, Fsid, OpCode, OsdFlags, PgId, SnapContext, Vino, NOSNAP};

pub type Result<T> = std::result::Result<T, OsdcError>;
