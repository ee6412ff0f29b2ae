//! A privileged watchdog for supervised servers.
//!
//! The watchdog forks and executes a worker, the actual server, and
//! stays around as its privileged parent.  The worker talks to the
//! watchdog over a Unix domain socket, using short framed messages
//! that may carry a file descriptor.  Through this channel the worker
//! gets bound listen sockets and passwords, reports the end of its
//! initialization and receives administrative commands.
//!
//! Administrative clients connect to the same socket to restart,
//! reconfigure or stop the server.  If the worker dies, the watchdog
//! decides whether to restart it or to exit.
//!
//! # Examples
//!
//! A worker that asks for its listen socket and reports readiness:
//!
//! ```no_run
//! use wdog::{
//!     client::Client,
//!     message::{Family, Kind, ListenSocketKey},
//! };
//!
//! # async fn worker() -> Result<(), wdog::Error> {
//! let mut client = Client::from_env().await?;
//! let key = ListenSocketKey::new("http", Some("127.0.0.1"), 8080, Family::Inet);
//! let _listener = client.get_listen_socket(&key).await?;
//! client.end_init(1).await?;
//!
//! loop {
//!     match client.next_command().await?.kind() {
//!         Kind::Terminate | Kind::EmptyRead => break,
//!         kind => println!("received {}", kind),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! See `src/bin/demo-worker.rs` for a complete worker.

pub mod channel;
pub mod client;
pub mod config;
mod error;
pub mod lsmgr;
pub mod message;
pub mod net;
pub mod password;
pub mod process;
pub mod relay;
pub mod signals;
pub mod state;
pub mod supervisor;
pub mod table;

pub use {config::Config, error::Error, supervisor::Supervisor};
