use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::Url;

use pubforge_client_engine::{CoordinatorConfig, QueueConfig};

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000/";

fn default_poll_interval_ms() -> u64 {
    CoordinatorConfig::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_per_page() -> u32 {
    QueueConfig::default().per_page
}

#[derive(Debug, Clone, Parser)]
#[command(name = "pubforge", version, about = "Generate pending books and follow their progress")]
pub struct Cli {
    #[arg(long, global = true, env = "PUBFORGE_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    pub backend_url: Url,

    /// Access token; overrides the saved credentials.
    #[arg(long, global = true, env = "PUBFORGE_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Delay between two progress polls.
    #[arg(
        long,
        global = true,
        env = "PUBFORGE_POLL_INTERVAL_MS",
        default_value_t = default_poll_interval_ms(),
        value_parser = clap::value_parser!(u64).range(50..)
    )]
    pub poll_interval_ms: u64,

    /// Print plain lines instead of a progress bar.
    #[arg(long, global = true, env = "PUBFORGE_NO_PROGRESS", default_value_t = false)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let mut cfg = CoordinatorConfig::new(self.backend_url.clone());
        cfg.poll_interval = Duration::from_millis(self.poll_interval_ms);
        cfg
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start generating every pending book and follow the job.
    Generate,
    /// Reattach to the last job started from this machine.
    Recover,
    /// Stop the last job started from this machine.
    Stop,
    /// Print the backend's view of the last job.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Show a page of the book queue.
    Queue(QueueArgs),
    /// Save `--token` as the default access token.
    Login,
    /// Forget the saved access token.
    Logout,
}

#[derive(Debug, Clone, Args)]
pub struct QueueArgs {
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub page: u32,

    #[arg(
        long,
        default_value_t = default_per_page(),
        value_parser = clap::value_parser!(u32).range(1..=500)
    )]
    pub per_page: u32,

    /// Bypass the cached copy.
    #[arg(long)]
    pub refresh: bool,

    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "pubforge",
            "generate",
            "--backend-url",
            "http://backend.test/api/",
            "--poll-interval-ms",
            "250",
            "--no-progress",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Generate));
        assert!(cli.no_progress);
        let cfg = cli.coordinator_config();
        assert_eq!(cfg.backend_url.as_str(), "http://backend.test/api/");
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn queue_defaults() {
        let cli = Cli::try_parse_from(["pubforge", "queue"]).unwrap();
        let Command::Queue(args) = cli.command else {
            panic!("expected queue");
        };
        assert_eq!(args.page, 1);
        assert_eq!(args.per_page, 50);
        assert!(!args.refresh);
    }

    #[test]
    fn poll_interval_has_a_floor() {
        assert!(Cli::try_parse_from(["pubforge", "generate", "--poll-interval-ms", "5"]).is_err());
    }
}
