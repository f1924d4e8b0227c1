//! Resolved server configuration.
//!
//! The CLI (or an embedding application) resolves flags into one [`Config`]
//! before anything binds or serves. After that point the value is immutable:
//! it is passed explicitly into [`Server::bind`](crate::Server::bind) and
//! shared read-only by every concurrently handled request, so no part of the
//! core needs ambient global state.

use std::path::PathBuf;

use crate::sort::SortPolicy;

/// Where the server listens.
///
/// A closed enum resolved at configuration time. Unsupported transport kinds
/// are rejected while building the `Config`, so the listener never has to
/// handle one at runtime.
#[derive(Clone, Debug)]
pub enum Transport {
    /// Network socket. The string is `host:port`; names resolve at bind time.
    Tcp(String),
    /// Unix-domain socket bound to a filesystem path.
    #[cfg(unix)]
    Unix(PathBuf),
}

/// Immutable configuration, resolved once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Document root. Every servable resource resolves beneath this path.
    pub root: PathBuf,
    /// Listening transport.
    pub transport: Transport,
    /// Expect a PROXY protocol preamble on every accepted connection.
    pub proxy_protocol: bool,
    /// Close connections whose preamble is absent or malformed instead of
    /// replaying the bytes as request data. Meaningful only with
    /// `proxy_protocol`.
    pub proxy_strict: bool,
    /// Emit one access-log event per request.
    pub access_log: bool,
    /// Render a listing when a request resolves to a directory.
    pub directory_listing: bool,
    /// Ordering applied to directory listings.
    pub sort: SortPolicy,
    /// Serve and list entries whose name starts with a period.
    pub serve_dotfiles: bool,
    /// Serve `index.html` in place of a directory listing when present.
    pub serve_index: bool,
}

impl Default for Config {
    /// The out-of-the-box behavior: current directory on `localhost:8000`,
    /// listings on, dotfiles hidden, no PROXY protocol.
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            transport: Transport::Tcp("localhost:8000".to_string()),
            proxy_protocol: false,
            proxy_strict: false,
            access_log: true,
            directory_listing: true,
            sort: SortPolicy::default(),
            serve_dotfiles: false,
            serve_index: true,
        }
    }
}
