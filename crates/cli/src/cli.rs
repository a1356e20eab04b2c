use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cm")]
#[command(about = "CookieMonster - capture browser auth headers over CDP and replay them")]
#[command(version)]
pub struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Attach to a debuggable browser and record matching requests
    Capture(CaptureArgs),

    /// Replay a request built from a stored capture
    Replay(ReplayArgs),

    /// Run the local control-plane HTTP server
    Serve(ServeArgs),

    /// List what a capture store holds (auth presence, never values)
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct CaptureArgs {
    /// Capture store to append to
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Browser debug host
    #[arg(long, default_value = "127.0.0.1")]
    pub browser_host: String,

    /// Browser debug port
    #[arg(long, default_value_t = 9222)]
    pub browser_port: u16,

    /// Pick the debug target whose url/title contains this
    #[arg(long, value_name = "TEXT", default_value = "")]
    pub target_hint: String,

    /// Stop after this many seconds
    #[arg(short, long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Stop after this many records
    #[arg(short = 'n', long, value_name = "COUNT")]
    pub max_records: Option<u64>,

    /// Keep every request header, not just auth and sensitive ones
    #[arg(long)]
    pub all_headers: bool,

    /// Collect request bodies
    #[arg(long)]
    pub post_data: bool,

    /// Also observe response and loading-failure events
    #[arg(long)]
    pub responses: bool,

    /// Keep only requests whose host contains this (repeatable)
    #[arg(long = "host", value_name = "HOST")]
    pub host_filter: Vec<String>,

    /// Keep only these methods (repeatable, uppercase)
    #[arg(long = "method", value_name = "VERB")]
    pub method_filter: Vec<String>,

    /// Keep only these resource types (repeatable)
    #[arg(long = "resource-type", value_name = "TYPE")]
    pub resource_type_filter: Vec<String>,

    #[command(flatten)]
    pub key: KeyArgs,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Capture store to select from
    #[arg(short, long, value_name = "FILE")]
    pub file: PathBuf,

    /// Outbound URL to issue
    #[arg(short, long, value_name = "URL")]
    pub url: String,

    /// Outbound method; defaults to the capture's
    #[arg(short, long, value_name = "VERB")]
    pub method: Option<String>,

    /// Select the capture whose URL contains this
    #[arg(long, value_name = "TEXT")]
    pub url_contains: Option<String>,

    /// Select by capture method
    #[arg(long, value_name = "VERB")]
    pub select_method: Option<String>,

    /// Select the Nth match instead of the last
    #[arg(long, value_name = "N")]
    pub index: Option<usize>,

    /// Send the captured request body
    #[arg(long, conflicts_with_all = ["body_file", "body_json"])]
    pub body_captured: bool,

    /// Send this file as the request body
    #[arg(long, value_name = "FILE", conflicts_with = "body_json")]
    pub body_file: Option<PathBuf>,

    /// Send this JSON value as the request body
    #[arg(long, value_name = "JSON")]
    pub body_json: Option<String>,

    /// Extra header NAME:VALUE, merged over the capture's (repeatable)
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
    pub headers: Vec<String>,

    /// Require the outbound host to equal the capture's host
    #[arg(long)]
    pub enforce_capture_host: bool,

    /// Header-rewrite adapter to apply
    #[arg(long, value_name = "NAME")]
    pub adapter: Option<String>,

    /// Total attempts on transient failures and 5xx
    #[arg(long, default_value_t = 1)]
    pub attempts: u32,

    /// Base backoff seconds between attempts
    #[arg(long, default_value_t = 0.5)]
    pub backoff: f64,

    /// Apply full jitter to backoff
    #[arg(long)]
    pub jitter: bool,

    /// Per-attempt timeout seconds
    #[arg(long, default_value_t = 30.0)]
    pub timeout: f64,

    #[command(flatten)]
    pub key: KeyArgs,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8787")]
    pub bind: String,

    /// Require this token on every mutating request
    #[arg(long, value_name = "TOKEN")]
    pub api_token: Option<String>,

    /// Permit binding beyond loopback
    #[arg(long)]
    pub allow_remote: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Capture store to read
    #[arg(short, long, value_name = "FILE")]
    pub file: PathBuf,

    /// Include header names and redacted values per record
    #[arg(long)]
    pub show_headers: bool,

    #[command(flatten)]
    pub key: KeyArgs,
}

/// Store-key source flags; inline wins over file, and the
/// COOKIE_MONSTER_ENCRYPTION_KEY variable backs both when neither is given.
#[derive(Args, Debug)]
pub struct KeyArgs {
    /// base64url store key
    #[arg(long = "key", value_name = "KEY", conflicts_with = "key_file")]
    pub key_inline: Option<String>,

    /// File holding the base64url store key
    #[arg(long, value_name = "FILE")]
    pub key_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_args_parse() {
        let cli = Cli::parse_from([
            "cm", "capture", "-o", "cap.jsonl", "--host", "a.example", "--host", "b.example",
            "-n", "10", "--post-data",
        ]);
        let Commands::Capture(args) = cli.command else {
            panic!("expected capture");
        };
        assert_eq!(args.host_filter, ["a.example", "b.example"]);
        assert_eq!(args.max_records, Some(10));
        assert!(args.post_data);
        assert!(!args.all_headers);
    }

    #[test]
    fn replay_args_parse() {
        let cli = Cli::parse_from([
            "cm",
            "replay",
            "-f",
            "cap.jsonl",
            "-u",
            "https://a.example/x",
            "-H",
            "X-Extra: 1",
            "--attempts",
            "3",
        ]);
        let Commands::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.attempts, 3);
        assert_eq!(args.headers, ["X-Extra: 1"]);
    }

    #[test]
    fn key_flags_conflict() {
        let result = Cli::try_parse_from([
            "cm", "list", "-f", "cap.jsonl", "--key", "AAAA", "--key-file", "k.txt",
        ]);
        assert!(result.is_err());
    }
}
