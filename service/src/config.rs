use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;

/// Runtime configuration, resolved flag → environment variable → default.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Send CORS headers on event stream responses.
    #[arg(long, env = "FRODO_CORS")]
    pub cors: bool,

    /// Application name, used as the bus exchange name.
    #[arg(long, env = "FRODO_NAME", default_value = "frodo")]
    pub appname: String,

    /// Bind address. An empty host (`:3000`) listens on all interfaces.
    #[arg(long, env = "FRODO_BIND", default_value = ":3000")]
    pub bind: String,

    /// Broker URL.
    #[arg(long, env = "FRODO_BROKER", default_value = "amqp://")]
    pub broker: String,

    /// Cache URL. Unset or empty disables the last-message cache.
    #[arg(long, env = "FRODO_CACHE")]
    cache: Option<String>,

    /// Cache key TTL in seconds. 0 keeps keys until overwritten.
    #[arg(long, env = "FRODO_TTL", default_value_t = 60)]
    pub ttl: u64,

    /// Sentry DSN. Unset or empty disables Sentry log forwarding.
    #[arg(long = "log-sentry", env = "FRODO_LOG_SENTRY")]
    log_sentry: Option<String>,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    /// Returns the cache URL, if one is configured. An empty value counts as
    /// not configured.
    pub fn cache(&self) -> Option<&str> {
        self.cache.as_deref().filter(|url| !url.is_empty())
    }

    /// Returns the Sentry DSN, if one is configured.
    pub fn log_sentry(&self) -> Option<&str> {
        self.log_sentry.as_deref().filter(|dsn| !dsn.is_empty())
    }

    /// Last-message retention is tied to the cache: with a cache configured,
    /// channels keep their last broadcast for late joiners and idle channels
    /// are swept instead of closed immediately.
    pub fn retention(&self) -> bool {
        self.cache().is_some()
    }

    /// The bind address in the form `TcpListener` accepts. The host part
    /// defaults to all interfaces when left empty.
    pub fn bind_addr(&self) -> String {
        if self.bind.starts_with(':') {
            format!("0.0.0.0{}", self.bind)
        } else {
            self.bind.clone()
        }
    }
}
