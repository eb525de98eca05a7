//! Command-line argument parsing for the download manager
//!
//! This module defines the CLI structure using clap derive macros:
//! fetching single files, fetching a group from a manifest, resuming
//! interrupted transfers and listing what is persisted.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::app::transfer::Headers;

/// Download manager - resumable, checksum-verified HTTP downloads
#[derive(Parser, Debug)]
#[command(
    name = "download-manager",
    version,
    about = "Resumable, checksum-verified HTTP downloads",
    long_about = "Downloads files over HTTP one at a time, verifies their checksums and can run a
command on each finished file. Interrupted transfers are persisted and can be resumed later."
)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all subcommands
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Verbose logging; repeat (-vv) for debug output
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Very verbose logging (debug level)
    #[arg(long, global = true)]
    pub very_verbose: bool,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download one or more files
    Fetch(FetchArgs),

    /// Download a group of files described by a JSON manifest
    Group(GroupArgs),

    /// Continue persisted transfers
    Resume,

    /// Show persisted transfers
    List,
}

/// Arguments for the fetch command
#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// URLs to download
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Expected checksum of the downloaded file
    #[arg(long)]
    pub hash: Option<String>,

    /// Checksum algorithm (md5, sha1, sha224, sha256, sha384, sha512)
    #[arg(long)]
    pub algorithm: Option<String>,

    /// Directory to download into
    #[arg(short = 'd', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Exact destination path (single URL only)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Extra request header, as "Name: value"
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Throttle in bytes per second (0 = unlimited)
    #[arg(long)]
    pub throttle: Option<u64>,

    /// Allow the download on mobile networks
    #[arg(long)]
    pub allow_mobile: bool,

    /// Command run on each finished file; "$file" is replaced by its path
    #[arg(long, value_name = "CMD")]
    pub exec: Option<String>,
}

/// Arguments for the group command
#[derive(Args, Debug, Clone)]
pub struct GroupArgs {
    /// JSON list of {"url", "local_file", "hash"} objects
    #[arg(value_name = "MANIFEST")]
    pub manifest: PathBuf,

    /// Checksum algorithm shared by every file
    #[arg(long)]
    pub algorithm: Option<String>,

    /// Directory relative file names are resolved against
    #[arg(short = 'd', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Throttle in bytes per second (0 = unlimited)
    #[arg(long)]
    pub throttle: Option<u64>,

    /// Allow the downloads on mobile networks
    #[arg(long)]
    pub allow_mobile: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the logging level based on global arguments
    pub fn log_level(&self) -> tracing::Level {
        if self.global.quiet {
            tracing::Level::ERROR
        } else if self.global.very_verbose || self.global.verbose >= 2 {
            tracing::Level::DEBUG
        } else if self.global.verbose == 1 {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        }
    }
}

impl FetchArgs {
    /// Check option combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.urls.len() > 1 && self.output.is_some() {
            return Err("--output can only be used with a single URL".to_string());
        }
        if self.urls.len() > 1 && self.hash.is_some() {
            return Err("--hash can only be used with a single URL".to_string());
        }
        if self.algorithm.is_some() && self.hash.is_none() {
            return Err("--algorithm requires --hash".to_string());
        }
        if let Some(exec) = &self.exec {
            if exec.trim().is_empty() {
                return Err("--exec needs a command".to_string());
            }
        }
        self.parsed_headers().map(|_| ())
    }

    /// Headers given with `-H`
    pub fn parsed_headers(&self) -> Result<Headers, String> {
        let mut headers = Headers::new();
        for raw in &self.headers {
            let (name, value) = raw
                .split_once(':')
                .ok_or_else(|| format!("Header '{}' is not in 'Name: value' form", raw))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("Header '{}' has no name", raw));
            }
            headers.insert(name.to_string(), value.trim().to_string());
        }
        Ok(headers)
    }

    /// Post-download command split into program and arguments
    pub fn post_command(&self) -> Option<Vec<String>> {
        self.exec
            .as_ref()
            .map(|exec| exec.split_whitespace().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_args(urls: &[&str]) -> FetchArgs {
        FetchArgs {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            hash: None,
            algorithm: None,
            output_dir: None,
            output: None,
            headers: Vec::new(),
            throttle: None,
            allow_mobile: false,
            exec: None,
        }
    }

    #[test]
    fn test_fetch_args_validation() {
        let mut args = fetch_args(&["http://example.com/a", "http://example.com/b"]);
        assert!(args.validate().is_ok());

        // Invalid: explicit destination for several URLs
        args.output = Some(PathBuf::from("/tmp/a"));
        assert!(args.validate().is_err());

        // Invalid: algorithm without a hash
        let mut single = fetch_args(&["http://example.com/a"]);
        single.algorithm = Some("sha256".to_string());
        assert!(single.validate().is_err());
        single.hash = Some("abc".to_string());
        assert!(single.validate().is_ok());
    }

    #[test]
    fn test_header_parsing() {
        let mut args = fetch_args(&["http://example.com/a"]);
        args.headers = vec![
            "Authorization: Bearer token".to_string(),
            "X-Trace:abc".to_string(),
        ];

        let headers = args.parsed_headers().unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer token");
        assert_eq!(headers.get("X-Trace").unwrap(), "abc");

        args.headers = vec!["no-colon".to_string()];
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_post_command_split() {
        let mut args = fetch_args(&["http://example.com/a"]);
        assert!(args.post_command().is_none());

        args.exec = Some("tar -xf $file".to_string());
        assert_eq!(
            args.post_command().unwrap(),
            vec!["tar".to_string(), "-xf".to_string(), "$file".to_string()]
        );
    }

    #[test]
    fn test_log_level() {
        let cli = Cli::try_parse_from(["download-manager", "-q", "list"]).unwrap();
        assert_eq!(cli.log_level(), tracing::Level::ERROR);

        let cli = Cli::try_parse_from(["download-manager", "-v", "list"]).unwrap();
        assert_eq!(cli.log_level(), tracing::Level::INFO);

        let cli = Cli::try_parse_from(["download-manager", "-vv", "resume"]).unwrap();
        assert_eq!(cli.log_level(), tracing::Level::DEBUG);

        let cli = Cli::try_parse_from(["download-manager", "list"]).unwrap();
        assert_eq!(cli.log_level(), tracing::Level::WARN);
    }

    #[test]
    fn test_fetch_requires_url() {
        assert!(Cli::try_parse_from(["download-manager", "fetch"]).is_err());

        let cli = Cli::try_parse_from([
            "download-manager",
            "fetch",
            "http://example.com/a.iso",
            "-H",
            "Accept: */*",
            "--throttle",
            "1024",
        ])
        .unwrap();
        match cli.command {
            Commands::Fetch(args) => {
                assert_eq!(args.urls, vec!["http://example.com/a.iso".to_string()]);
                assert_eq!(args.throttle, Some(1024));
                assert_eq!(args.headers.len(), 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
