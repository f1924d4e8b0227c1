//! Command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tsuka::{Config, Server, SortPolicy, Transport};

/// Static file server with PROXY protocol support.
#[derive(Parser, Debug)]
#[command(name = "tsuka", author, version, about, long_about = None)]
struct Cli {
    /// Transport kind: "tcp" or "unix".
    #[arg(long, default_value = "tcp", value_name = "kind")]
    network: String,

    /// address:port for tcp, or a filesystem path for unix.
    #[arg(long, default_value = "localhost:8000")]
    addr: String,

    /// Document root.
    #[arg(long, default_value = ".", value_name = "path")]
    root: PathBuf,

    /// Expect a PROXY protocol preamble on every connection.
    #[arg(long)]
    proxy: bool,

    /// Close connections whose preamble is absent or malformed instead of
    /// treating the bytes as request data.
    #[arg(long, requires = "proxy")]
    proxy_strict: bool,

    /// Disable the access log.
    #[arg(long)]
    no_access_log: bool,

    /// Disable directory listings.
    #[arg(long)]
    no_list: bool,

    /// List entries intermixed instead of directories first.
    #[arg(long)]
    no_dir_first: bool,

    /// Sort listings case-sensitively.
    #[arg(long)]
    no_ignore_case: bool,

    /// Serve and list dot files.
    #[arg(long)]
    dotfiles: bool,

    /// Do not serve index.html in place of a directory listing.
    #[arg(long)]
    no_index: bool,
}

impl Cli {
    fn into_config(self) -> tsuka::Result<Config> {
        let transport = match self.network.as_str() {
            "tcp" => Transport::Tcp(self.addr),
            #[cfg(unix)]
            "unix" => Transport::Unix(PathBuf::from(self.addr)),
            other => {
                return Err(tsuka::Error::Config(format!(
                    "unsupported network {other:?} (expected \"tcp\" or \"unix\")"
                )));
            }
        };

        // Resolve the root once; everything downstream assumes it exists.
        let root = std::fs::canonicalize(&self.root).map_err(|e| {
            tsuka::Error::Config(format!("document root {}: {e}", self.root.display()))
        })?;

        Ok(Config {
            root,
            transport,
            proxy_protocol: self.proxy,
            proxy_strict: self.proxy_strict,
            access_log: !self.no_access_log,
            directory_listing: !self.no_list,
            sort: SortPolicy {
                directories_first: !self.no_dir_first,
                case_insensitive: !self.no_ignore_case,
            },
            serve_dotfiles: self.dotfiles,
            serve_index: !self.no_index,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let network = cli.network.clone();
    let addr = cli.addr.clone();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::bind(&config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(root = %config.root.display(), "serving on [{network}] {addr}");

    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
