use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use std::path::PathBuf;

/// Startup configuration for the bridge.
///
/// Built from the command line (with `PGBRIDGE_*` environment fallbacks) in
/// `main`, or from [`Config::default`] in tests.
#[derive(Clone, Debug, Serialize)]
pub struct Config {
    /// SQLite database file. Ignored when `in_memory` is set.
    pub database: PathBuf,
    /// TCP listen address, `host:port`.
    pub listen: String,
    /// Directory for the `.s.PGSQL.<port>` Unix socket, if any.
    pub socket_dir: Option<PathBuf>,
    pub no_tcp: bool,
    pub in_memory: bool,
    pub journal_mode: String,
    pub synchronous: String,
    pub busy_timeout_ms: u64,
    /// Idle SQLite handles kept for reuse by later sessions.
    pub pool_size: usize,
    pub max_connections: usize,
    pub translation_cache_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("pgbridge.db"),
            listen: "127.0.0.1:5432".to_string(),
            socket_dir: None,
            no_tcp: false,
            in_memory: false,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            busy_timeout_ms: 5000,
            pool_size: 8,
            max_connections: 100,
            translation_cache_size: 256,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn command() -> Command {
        let defaults = Config::default();
        Command::new("pgbridge")
            .about("PostgreSQL wire protocol server on top of a single SQLite database file")
            .arg(
                Arg::new("database")
                    .long("database")
                    .short('d')
                    .value_name("FILE")
                    .env("PGBRIDGE_DATABASE")
                    .default_value(defaults.database.display().to_string())
                    .help("SQLite database file"),
            )
            .arg(
                Arg::new("listen")
                    .long("listen")
                    .value_name("ADDR")
                    .env("PGBRIDGE_LISTEN")
                    .default_value(defaults.listen)
                    .help("Listen address for the TCP server"),
            )
            .arg(
                Arg::new("socket-dir")
                    .long("socket-dir")
                    .value_name("DIR")
                    .env("PGBRIDGE_SOCKET_DIR")
                    .help("Directory for the Unix domain socket (.s.PGSQL.<port>)"),
            )
            .arg(
                Arg::new("no-tcp")
                    .long("no-tcp")
                    .action(ArgAction::SetTrue)
                    .help("Only listen on the Unix domain socket"),
            )
            .arg(
                Arg::new("in-memory")
                    .long("in-memory")
                    .action(ArgAction::SetTrue)
                    .help("Use a throwaway database in scratch space, on /dev/shm where available (contents are lost on exit)"),
            )
            .arg(
                Arg::new("journal-mode")
                    .long("journal-mode")
                    .value_name("MODE")
                    .env("PGBRIDGE_JOURNAL_MODE")
                    .default_value(defaults.journal_mode)
                    .help("SQLite journal mode (WAL, DELETE, TRUNCATE, ...)"),
            )
            .arg(
                Arg::new("synchronous")
                    .long("synchronous")
                    .value_name("LEVEL")
                    .env("PGBRIDGE_SYNCHRONOUS")
                    .default_value(defaults.synchronous)
                    .help("SQLite synchronous level (OFF, NORMAL, FULL)"),
            )
            .arg(
                Arg::new("busy-timeout-ms")
                    .long("busy-timeout-ms")
                    .value_name("MS")
                    .value_parser(clap::value_parser!(u64))
                    .default_value(defaults.busy_timeout_ms.to_string())
                    .help("How long a writer waits for the SQLite lock before reporting it as locked"),
            )
            .arg(
                Arg::new("pool-size")
                    .long("pool-size")
                    .value_name("N")
                    .value_parser(clap::value_parser!(usize))
                    .default_value(defaults.pool_size.to_string())
                    .help("Idle SQLite handles kept for reuse"),
            )
            .arg(
                Arg::new("max-connections")
                    .long("max-connections")
                    .value_name("N")
                    .value_parser(clap::value_parser!(usize))
                    .default_value(defaults.max_connections.to_string())
                    .help("Maximum number of concurrent client sessions"),
            )
            .arg(
                Arg::new("translation-cache-size")
                    .long("translation-cache-size")
                    .value_name("N")
                    .value_parser(clap::value_parser!(usize))
                    .default_value(defaults.translation_cache_size.to_string())
                    .help("Number of translated statements kept in the LRU cache"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("FILTER")
                    .env("PGBRIDGE_LOG_LEVEL")
                    .default_value(defaults.log_level)
                    .help("tracing filter used when RUST_LOG is not set"),
            )
    }

    pub fn from_matches(matches: &ArgMatches) -> Self {
        let defaults = Config::default();
        let string = |name: &str, fallback: String| {
            matches.get_one::<String>(name).cloned().unwrap_or(fallback)
        };
        Self {
            database: PathBuf::from(string("database", defaults.database.display().to_string())),
            listen: string("listen", defaults.listen),
            socket_dir: matches.get_one::<String>("socket-dir").map(PathBuf::from),
            no_tcp: matches.get_flag("no-tcp"),
            in_memory: matches.get_flag("in-memory"),
            journal_mode: string("journal-mode", defaults.journal_mode),
            synchronous: string("synchronous", defaults.synchronous),
            busy_timeout_ms: matches
                .get_one::<u64>("busy-timeout-ms")
                .copied()
                .unwrap_or(defaults.busy_timeout_ms),
            pool_size: matches.get_one::<usize>("pool-size").copied().unwrap_or(defaults.pool_size),
            max_connections: matches
                .get_one::<usize>("max-connections")
                .copied()
                .unwrap_or(defaults.max_connections),
            translation_cache_size: matches
                .get_one::<usize>("translation-cache-size")
                .copied()
                .unwrap_or(defaults.translation_cache_size),
            log_level: string("log-level", defaults.log_level),
        }
    }

    /// Config for a throwaway database.
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            synchronous: "OFF".to_string(),
            ..Self::default()
        }
    }

    /// Port component of `listen`, used to name the Unix socket.
    pub fn port(&self) -> u16 {
        self.listen
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432)
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_dir
            .as_ref()
            .map(|dir| dir.join(format!(".s.PGSQL.{}", self.port())))
    }
}
