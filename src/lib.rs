//! # tsuka
//!
//! A static file server for the space behind a reverse proxy.
//! It serves files. Nothing more. Nothing less.
//!
//! ## The contract
//!
//! The proxy in front (HAProxy, nginx, a cloud balancer) owns TLS, rate
//! limiting, slow clients, and compression. tsuka does not. What the proxy
//! cannot do is read your disk, so that is the whole job here:
//!
//! - **Transports**: a TCP socket, or a Unix-domain socket for proxies on
//!   the same host (stale socket files are cleaned up, permissions kept
//!   tight).
//! - **PROXY protocol**: v1 and v2 preambles are stripped from the byte
//!   stream before HTTP parsing, and the declared client address replaces
//!   the socket peer everywhere it is observable.
//! - **Policies**: directory listings with a configurable sort order,
//!   dotfile visibility, `index.html` resolution. All decided once at
//!   startup, immutable afterwards.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tsuka::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> tsuka::Result<()> {
//!     let config = Config {
//!         root: "/srv/www".into(),
//!         ..Config::default()
//!     };
//!     Server::bind(&config).await?.serve().await
//! }
//! ```
//!
//! The `tsuka` binary wraps exactly this, with one flag per [`Config`]
//! field.

mod config;
mod cors;
mod error;
mod handler;
mod listener;
mod listing;
mod proxy;
mod server;
mod sort;

pub use config::{Config, Transport};
pub use cors::Cors;
pub use error::{Error, Result};
pub use handler::FileServer;
pub use listener::{Conn, Listener, Peer};
pub use listing::DirEntry;
pub use proxy::{ProxyMode, ProxyParseError, ProxyStream, RemoteAddr};
pub use server::Server;
pub use sort::SortPolicy;
