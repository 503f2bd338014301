//! Device-side channel sync client for realtime cloud document stores.
//!
//! Keeps a small, fixed set of named channels (key/value properties)
//! synchronized between a device and a remote realtime store over one
//! long-lived event stream, while batching local changes into debounced
//! outbound writes and running a tiny cron scheduler that can mutate
//! channels on a timer.
//!
//! # Architecture
//!
//! ```text
//!            +-----------------+    bytes    +------------------+
//!  server -> | StreamTransport | ----------> | Dispatcher       |
//!            | (SSE + reconnect)|   scan     | (one update at a |
//!            +-----------------+             |  time, no tree)  |
//!                                            +---------+--------+
//!                                                      |
//!                              +-----------------------+---------+
//!                              v                                 v
//!                       +-------------+                  +----------------+
//!                       | ChannelStore|<-----------------| ScheduleEngine |
//!                       | (hash/dirty)|   timed writes   | (cron jobs)    |
//!                       +------+------+                  +----------------+
//!                              |  dirty channels
//!                              v
//!                       +-------------+
//!                       | BatchWriter | -> PATCH (separate connection)
//!                       +-------------+
//! ```
//!
//! Everything runs inside one cooperative [`Client::tick`]; no background
//! tasks, no locks.

pub mod bounded;
pub mod client;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod scan;
pub mod schedule;
pub mod session;
pub mod store;
pub mod transport;
pub mod writer;

pub use bounded::BoundedBuf;
pub use client::Client;
pub use config::{ClientConfig, MAX_CHANNELS, MAX_SCHEDULES};
pub use connector::{Connector, StreamSocket, TlsConnector};
pub use error::{ClientError, Result};
pub use schedule::{JobMode, ScheduleJob};
pub use session::{SessionProvider, StaticSession};
pub use store::{ChannelValue, SuppressReason, UpdateOutcome};
pub use transport::SocketState;
