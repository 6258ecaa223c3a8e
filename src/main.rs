use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod app;

use app::{App, Command};
use feedhoard::adapter::Direction;
use feedhoard::config::Config;
use feedhoard::error::{AppError, Result};
use feedhoard::models::JsonMap;

const USAGE: &str = "usage: feedhoard <command> [args]

commands:
  setup <plugin> [key=value...]     store plugin configuration
  subscribe <plugin> <name> <url>   subscribe to the query a url points at
  list <source> [--disabled]        list subscriptions
  enable <source>:<name>
  disable <source>:<name>
  interval <source>[:<name>] <minutes|none>
                                    set how often the scheduler updates
  update <source>:<name>            fetch everything newer than the last update
  fetch <source>:<name> <n>         fetch up to n older posts
  rfetch <source>:<name> <n>        fetch up to n newer posts
  download <url>...                 download single posts
  files <post-id>                   show a post's files
  delete <post-id>                  delete a post and its files
  schedule                          update every due subscription
  audit [--apply]                   check the file tree against the database";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let app = App::new(config).await?;
    if let Err(e) = app.run(command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Command> {
    let usage = |msg: &str| AppError::Config(msg.to_string());
    let arg = |i: usize, what: &str| {
        args.get(i)
            .cloned()
            .ok_or_else(|| usage(&format!("missing {}", what)))
    };
    let count = |i: usize| -> Result<usize> {
        arg(i, "post count")?
            .parse()
            .map_err(|_| usage("post count must be a number"))
    };

    let name = args.first().map(String::as_str).unwrap_or_default();
    let command = match name {
        "setup" => Command::Setup {
            plugin: arg(1, "plugin")?,
            values: parse_values(&args[2..])?,
        },
        "subscribe" => Command::Subscribe {
            plugin: arg(1, "plugin")?,
            name: arg(2, "name")?,
            url: arg(3, "url")?,
        },
        "list" => Command::List {
            source: arg(1, "source")?,
            disabled: args.iter().any(|a| a == "--disabled"),
        },
        "enable" | "disable" => Command::Enable {
            target: arg(1, "<source>:<name>")?,
            enabled: name == "enable",
        },
        "interval" => Command::Interval {
            target: arg(1, "<source>[:<name>]")?,
            minutes: match arg(2, "interval")?.as_str() {
                "none" => None,
                minutes => Some(
                    minutes
                        .parse()
                        .map_err(|_| usage("interval must be a number of minutes or none"))?,
                ),
            },
        },
        "update" => Command::Traverse {
            target: arg(1, "<source>:<name>")?,
            direction: Direction::Newer,
            limit: None,
        },
        "fetch" => Command::Traverse {
            target: arg(1, "<source>:<name>")?,
            direction: Direction::Older,
            limit: Some(count(2)?),
        },
        "rfetch" => Command::Traverse {
            target: arg(1, "<source>:<name>")?,
            direction: Direction::Newer,
            limit: Some(count(2)?),
        },
        "download" if args.len() > 1 => Command::Download {
            urls: args[1..].to_vec(),
        },
        "files" => Command::Files {
            post_id: arg(1, "post id")?
                .parse()
                .map_err(|_| usage("post id must be a number"))?,
        },
        "delete" => Command::Delete {
            post_id: arg(1, "post id")?
                .parse()
                .map_err(|_| usage("post id must be a number"))?,
        },
        "schedule" => Command::Schedule,
        "audit" => Command::Audit {
            apply: args.iter().any(|a| a == "--apply"),
        },
        "" => return Err(usage("no command given")),
        other => return Err(usage(&format!("unknown command {}", other))),
    };
    Ok(command)
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn parse_values(args: &[String]) -> Result<JsonMap> {
    let mut values = JsonMap::new();
    for pair in args {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| AppError::Config(format!("expected key=value, got {}", pair)))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
        values.insert(key.to_string(), value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn fetch_takes_a_count() {
        match parse_args(&args("fetch feed:news 20")).unwrap() {
            Command::Traverse {
                direction, limit, ..
            } => {
                assert_eq!(direction, Direction::Older);
                assert_eq!(limit, Some(20));
            }
            _ => panic!("expected a traversal"),
        }
        assert!(parse_args(&args("fetch feed:news lots")).is_err());
    }

    #[test]
    fn setup_values_keep_json_types() {
        let values = parse_values(&args("token=abc retries=3 flag=true")).unwrap();
        assert_eq!(values["token"], "abc");
        assert_eq!(values["retries"], 3);
        assert_eq!(values["flag"], true);
    }

    #[test]
    fn interval_accepts_none() {
        match parse_args(&args("interval feed none")).unwrap() {
            Command::Interval { target, minutes } => {
                assert_eq!(target, "feed");
                assert_eq!(minutes, None);
            }
            _ => panic!("expected an interval"),
        }
        assert!(parse_args(&args("interval feed:news soon")).is_err());
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(parse_args(&args("frobnicate")).is_err());
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&args("download")).is_err());
    }
}
