//! Command-line interface for modvisor.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::process::OutputFormat;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for modvisor.
#[derive(Parser)]
#[command(name = "modv", version, author)]
#[command(about = "Run, supervise and watch script modules", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Shorthand for `--log-level debug`.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file (defaults to `~/.config/modvisor/config.yaml`).
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Effective log filter directive, `None` to defer to `RUST_LOG`.
    pub fn log_directive(&self) -> Option<&'static str> {
        match (self.log_level, self.verbose) {
            (Some(level), _) => Some(level.as_str()),
            (None, true) => Some("debug"),
            (None, false) => None,
        }
    }
}

/// A script inside a module plus the arguments passed to it.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    /// Module directory.
    pub module: PathBuf,

    /// Script name, extension optional (e.g. `svc/Start`).
    pub script: String,

    /// Arguments forwarded to the script.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl ScriptTarget {
    /// Script name followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.script.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Available commands for modv.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a module script to completion.
    Run {
        #[command(flatten)]
        target: ScriptTarget,

        /// Keep the script's output off the console.
        #[arg(long)]
        hide: bool,

        /// Print the captured stdout decoded as raw, json or hex.
        #[arg(short, long, value_name = "FORMAT")]
        format: Option<OutputFormat>,
    },

    /// Start a module script and supervise it until it exits or times out.
    Start {
        #[command(flatten)]
        target: ScriptTarget,

        /// Keep the script's output off the console.
        #[arg(long)]
        hide: bool,

        /// Kill the script after this many seconds.
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,
    },

    /// Run a script quietly and print its JSON result.
    Cap {
        #[command(flatten)]
        target: ScriptTarget,
    },

    /// Print the file a script name resolves to.
    Resolve {
        /// Module directory.
        module: PathBuf,

        /// Name segments, joined with `/`.
        #[arg(required = true)]
        name: Vec<String>,
    },

    /// Initialise version control and install a module's packages.
    Install {
        /// Module directory.
        module: PathBuf,

        /// Keep installer output off the console.
        #[arg(long)]
        hide: bool,
    },

    /// Print watch files as they change.
    Watch {
        /// Module directories.
        #[arg(required = true)]
        modules: Vec<PathBuf>,

        /// Exit after this many changes.
        #[arg(short = 'n', long, value_name = "N")]
        count: Option<usize>,
    },

    /// List the modules found under a directory.
    Scan {
        /// Directory to search (defaults to `module_root` from the settings,
        /// then the current directory).
        root: Option<PathBuf>,
    },

    /// Control a service inside a module.
    Service {
        #[command(subcommand)]
        action: ServiceCommand,
    },
}

/// Module directory, service directory and extra script arguments.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    /// Module directory.
    pub module: PathBuf,

    /// Service directory inside the module.
    pub dir: String,

    /// Arguments forwarded to the service scripts.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Service operations.
#[derive(Subcommand)]
pub enum ServiceCommand {
    /// Start (or restart) the service.
    Start {
        #[command(flatten)]
        target: ServiceTarget,

        /// Leave the service alone when it reports itself running.
        #[arg(long)]
        if_stopped: bool,
    },

    /// Stop the service.
    Stop {
        #[command(flatten)]
        target: ServiceTarget,
    },

    /// Print whether the service is running.
    Running {
        #[command(flatten)]
        target: ServiceTarget,
    },

    /// Disable the service.
    Disable {
        #[command(flatten)]
        target: ServiceTarget,

        /// Stop the service as well.
        #[arg(long)]
        stop: bool,
    },

    /// Re-enable a disabled service.
    Enable {
        #[command(flatten)]
        target: ServiceTarget,
    },

    /// Print whether the service is enabled or disabled.
    Status {
        #[command(flatten)]
        target: ServiceTarget,
    },
}

impl ServiceCommand {
    /// The service every action operates on.
    pub fn target(&self) -> &ServiceTarget {
        match self {
            ServiceCommand::Start { target, .. }
            | ServiceCommand::Stop { target }
            | ServiceCommand::Running { target }
            | ServiceCommand::Disable { target, .. }
            | ServiceCommand::Enable { target }
            | ServiceCommand::Status { target } => target,
        }
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
