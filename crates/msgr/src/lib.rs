//! Message transport surface for the OSD client.
//!
//! The core dispatch engine programs against this crate rather than a real
//! network stack: a [`Message`] carries a wire front, an optional inline data
//! section and a revocable page-vector slot; [`Connection`] and [`Messenger`]
//! are the seams a concrete transport plugs into.
//!
//! Delivery callbacks flow the other way: the transport hands incoming
//! messages to the client (`handle_reply`, `handle_map`), reports peer resets
//! (`handle_reset`), and asks the client to provide receive buffers before
//! reading a payload off the wire (`prepare_pages`).

pub mod connection;
pub mod error;
pub mod message;
pub mod page;
pub mod types;

pub use connection::{channel_connection, ChannelConnection, Connection, ConnectionRef, Messenger};
pub use error::{MsgrError, Result};
pub use message::{Message, MsgHeader, MSG_OSD_MAP, MSG_PING};
pub use page::{alloc_page_vec, calc_pages_for, Page, PageVec, PAGE_SIZE};
pub use types::{EntityAddr, EntityName};
