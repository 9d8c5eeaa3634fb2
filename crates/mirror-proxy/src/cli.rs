//! Command-line arguments. Flags given here win over the config file and
//! the environment.

use clap::Parser;

use crate::config::ProxyConfig;
use crate::proxy::select::{OrderPolicy, StatusSet};

/// Duplicate every inbound HTTP request to several servers and relay one
/// of their responses.
///
/// By default the response of the first server on the command line is
/// relayed. Use --order to pick another one.
#[derive(Debug, Parser)]
#[command(name = "mirror-proxy", version, about)]
pub struct Cli {
    /// Destination servers, e.g. `server1.org server2.com:8081`. A bare
    /// host is reached over plain HTTP. Replaces `upstream.destinations`.
    pub destinations: Vec<String>,

    /// TOML configuration file. Skipped when it does not exist.
    #[arg(long, env = "MIRROR_PROXY_CONFIG", default_value = "mirror-proxy.toml")]
    pub config: String,

    /// Address to listen on.
    #[arg(long)]
    pub listen: Option<String>,

    /// Response order: `command` (command-line order), `first-ok` (accepted
    /// statuses first) or `first-ko` (other statuses first).
    #[arg(long)]
    pub order: Option<OrderPolicy>,

    /// Accepted status codes, whitespace separated.
    #[arg(long)]
    pub expect: Option<StatusSet>,

    /// Log at debug level.
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    /// Overlay the flags that were given on `config`.
    pub fn apply(self, mut config: ProxyConfig) -> ProxyConfig {
        if !self.destinations.is_empty() {
            config.upstream.destinations = self.destinations;
        }
        if let Some(listen) = self.listen {
            config.server.listen_address = listen;
        }
        if let Some(policy) = self.order {
            config.ordering.policy = policy;
        }
        if let Some(accepted) = self.expect {
            config.ordering.accepted_statuses = accepted;
        }
        if self.verbose {
            config.tracing = config.tracing.verbose();
        }
        config
    }
}
