mod check;
mod run;
mod serve;

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;

use crate::core::config::AppConfig;
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Commands")
        .command("serve", "Start the REST API and the job scheduler (default)")
        .command("run", "Run the diagnostic pipeline once in the foreground")
        .command("check", "Validate the configuration and show the targets")
        .command("version", "Print the version")
        .command("help", "Show this help message")
        .print();

    GuideSection::new("Options")
        .text("--config, -c <path>     YAML configuration (default: config.yaml)")
        .text("--env-file <path>       Credentials file (default: .env)")
        .text("--host <addr>           Override server.host")
        .text("--port <port>           Override server.port")
        .text("--verbose, -v           Debug logging")
        .blank()
        .hint("routetest serve --config /etc/routetest/config.yaml", "")
        .hint("routetest run --env-file secrets.env", "")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("routetest").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CliOptions {
    pub config: PathBuf,
    pub env_file: PathBuf,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub verbose: bool,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.yaml"),
            env_file: PathBuf::from(".env"),
            host: None,
            port: None,
            verbose: false,
        }
    }
}

impl CliOptions {
    pub(crate) fn load_config(&self) -> Result<AppConfig> {
        AppConfig::load(&self.config, &self.env_file)
            .with_context(|| format!("failed to load configuration from {}", self.config.display()))
    }
}

pub(crate) fn parse_cli_options(args: &[String], start: usize) -> CliOptions {
    let mut options = CliOptions::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    options.config = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--env-file" => {
                if i + 1 < args.len() {
                    options.env_file = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    options.host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" => {
                if i + 1 < args.len() {
                    options.port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                options.verbose = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    options
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // A bare invocation, or one starting with flags, means `serve`.
    let (cmd, start) = match args.get(1).map(String::as_str) {
        None => ("serve", 1),
        Some(arg) if arg.starts_with('-') && !matches!(arg, "-h" | "--help" | "-V" | "--version") => {
            ("serve", 1)
        }
        Some(arg) => (arg, 2),
    };

    match cmd {
        "serve" => serve::run_serve(parse_cli_options(&args, start)).await,
        "run" => run::run_once(parse_cli_options(&args, start)).await,
        "check" => check::run_check(parse_cli_options(&args, start)),
        "version" | "--version" | "-V" => {
            println!("routetest {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command: {other}"));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_cli_options_reads_every_flag() {
        let args = args(&[
            "routetest",
            "serve",
            "--config",
            "/etc/routetest.yaml",
            "--env-file",
            "secrets.env",
            "--host",
            "127.0.0.1",
            "--port",
            "9090",
            "-v",
        ]);
        let options = parse_cli_options(&args, 2);
        assert_eq!(options.config, PathBuf::from("/etc/routetest.yaml"));
        assert_eq!(options.env_file, PathBuf::from("secrets.env"));
        assert_eq!(options.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(options.port, Some(9090));
        assert!(options.verbose);
    }

    #[test]
    fn parse_cli_options_defaults_and_ignores_bad_values() {
        let args = args(&["routetest", "run", "--port", "not-a-port", "--config"]);
        let options = parse_cli_options(&args, 2);
        assert_eq!(options.port, None);
        assert_eq!(options.config, PathBuf::from("config.yaml"));
        assert_eq!(options.env_file, PathBuf::from(".env"));
        assert!(!options.verbose);
    }
}
