use clap::{Arg, ArgAction, ArgMatches, Command};
use std::env;
use std::path::PathBuf;

pub struct Cli {
    pub config_path: PathBuf,
    pub interval: Option<u64>,
    pub monitor_only: bool,
    pub json: bool,
}

impl From<ArgMatches> for Cli {
    fn from(matches: ArgMatches) -> Self {
        Cli {
            config_path: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("refit.toml")),
            interval: matches.get_one::<u64>("watch").copied(),
            monitor_only: matches.get_flag("monitor_only"),
            json: matches.get_flag("json"),
        }
    }
}

fn command() -> Command {
    let default_watch_interval = env::var("WATCH_INTERVAL").unwrap_or_else(|_| "300".to_string());
    Command::new("refit")
        .version(env!("CARGO_PKG_VERSION"))
        .about("update docker containers to their newest images in link order")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the configuration file")
                .value_name("FILE")
                .default_value("refit.toml")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("watch")
                .short('w')
                .long("watch")
                .help(format!(
                    "Watch mode: re-run every N seconds (default: {default_watch_interval})"
                ))
                .value_name("SECONDS")
                .num_args(0..=1)
                .default_missing_value(default_watch_interval)
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("monitor_only")
                .long("monitor-only")
                .help("Only report stale containers, never replace them")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the report of every session as JSON")
                .action(ArgAction::SetTrue),
        )
}

pub(crate) fn configure_cli() -> Cli {
    command().get_matches().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_without_value_uses_default() {
        let cli: Cli = command()
            .try_get_matches_from(["refit", "--watch", "--json"])
            .unwrap()
            .into();
        assert!(cli.interval.is_some());
        assert!(cli.json);
        assert!(!cli.monitor_only);
        assert_eq!(cli.config_path, PathBuf::from("refit.toml"));
    }

    #[test]
    fn test_explicit_values() {
        let cli: Cli = command()
            .try_get_matches_from(["refit", "-w", "30", "-c", "/etc/refit.toml", "--monitor-only"])
            .unwrap()
            .into();
        assert_eq!(cli.interval, Some(30));
        assert!(cli.monitor_only);
        assert_eq!(cli.config_path, PathBuf::from("/etc/refit.toml"));
    }

    #[test]
    fn test_runs_once_by_default() {
        let cli: Cli = command().try_get_matches_from(["refit"]).unwrap().into();
        assert_eq!(cli.interval, None);
    }
}
