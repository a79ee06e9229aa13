use std::time::Duration;

use clap::Args;

use crate::{
    plan::{DEFAULT_AGENT_IMAGE, DEFAULT_SERVER_IMAGE, DEFAULT_WAIT_IMAGE, Images},
    render::{DEFAULT_CLUSTER_NAME, RenderOptions},
};

/// Operator-wide settings, from flags or the environment.
#[derive(Debug, Clone, Args)]
pub struct OperatorConfig {
    /// Cluster name the Kubernetes attestors are configured with
    #[arg(long, env = "SPIRE_CLUSTER_NAME", default_value = DEFAULT_CLUSTER_NAME)]
    pub cluster_name: String,

    #[arg(long, env = "SPIRE_SERVER_IMAGE", default_value = DEFAULT_SERVER_IMAGE)]
    pub server_image: String,

    #[arg(long, env = "SPIRE_AGENT_IMAGE", default_value = DEFAULT_AGENT_IMAGE)]
    pub agent_image: String,

    /// Init container image that waits for the server service
    #[arg(long, env = "SPIRE_WAIT_IMAGE", default_value = DEFAULT_WAIT_IMAGE)]
    pub wait_image: String,

    /// Seconds between SpireServer health polls
    #[arg(
        long,
        env = "SPIRE_HEALTH_POLL_SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub health_poll_secs: u64,
}

impl OperatorConfig {
    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            cluster_name: self.cluster_name.clone(),
        }
    }

    pub fn images(&self) -> Images {
        Images {
            server: self.server_image.clone(),
            agent: self.agent_image.clone(),
            wait_for_server: self.wait_image.clone(),
        }
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_secs)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    #[test]
    fn defaults_match_library_defaults() {
        let config = Cli::try_parse_from(["spire-operator"]).unwrap().config;
        assert_eq!(config.render_options(), RenderOptions::default());
        assert_eq!(config.images(), Images::default());
        assert_eq!(config.health_poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn flags_override_defaults() {
        let config = Cli::try_parse_from([
            "spire-operator",
            "--cluster-name",
            "prod",
            "--server-image",
            "registry.local/spire-server:1.9.0",
            "--health-poll-secs",
            "30",
        ])
        .unwrap()
        .config;

        assert_eq!(config.render_options().cluster_name, "prod");
        assert_eq!(config.images().server, "registry.local/spire-server:1.9.0");
        assert_eq!(config.images().agent, DEFAULT_AGENT_IMAGE);
        assert_eq!(config.health_poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn zero_poll_interval_is_refused() {
        assert!(Cli::try_parse_from(["spire-operator", "--health-poll-secs", "0"]).is_err());
    }
}
