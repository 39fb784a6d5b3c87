use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rvs_sdk::FinalizeTarget;

#[derive(Parser)]
#[command(
    name = "rvs",
    about = "Revision content store: inspect, populate and maintain a store root",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Repeat to raise the log level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Args)]
pub struct StoreArgs {
    /// Local store root (overrides `local_path` from the config file)
    #[arg(long = "store", global = true)]
    pub local: Option<PathBuf>,

    /// Shared cache root
    #[arg(long, global = true)]
    pub cache: Option<PathBuf>,

    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Another store root to fetch misses from
    #[arg(long, global = true)]
    pub remote: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the content of a revision
    Get(GetArgs),
    /// Show the ancestry of a revision
    History(HistoryArgs),
    /// Store a file as a new revision
    Add(AddArgs),
    /// Consolidate packs and sealed log segments
    Repack,
    /// Check every pack against its index
    Verify(VerifyArgs),
    /// Show store counters
    Stats,
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
pub struct GetArgs {
    pub path: String,
    /// Revision node, 40 hex digits
    pub node: String,
    /// Write the content to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Describe the stored entry instead of resolving its content
    #[arg(long)]
    pub raw: bool,
}

#[derive(Args)]
pub struct HistoryArgs {
    pub path: String,
    pub node: String,
    /// Number of ancestors to walk, the revision itself included
    #[arg(short = 'n', long, default_value = "1")]
    pub depth: usize,
}

#[derive(Args)]
pub struct AddArgs {
    /// Repository path of the revision
    pub path: String,
    /// File holding the revision text
    pub file: PathBuf,
    /// First parent node
    #[arg(long)]
    pub p1: Option<String>,
    /// Second parent node
    #[arg(long)]
    pub p2: Option<String>,
    /// Changeset node that introduced the revision
    #[arg(long)]
    pub linknode: Option<String>,
    /// Source path when the revision is a copy; p1 lives under this path
    #[arg(long)]
    pub copy_from: Option<String>,
    /// Store a delta against p1
    #[arg(long, requires = "p1")]
    pub delta: bool,
    /// Compress the payload at rest
    #[arg(long)]
    pub zstd: bool,
    /// Where the buffered revision is finalized
    #[arg(long = "to")]
    pub target: Option<Target>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Target {
    Auto,
    Log,
    Pack,
}

impl From<Target> for FinalizeTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::Auto => FinalizeTarget::Auto,
            Target::Log => FinalizeTarget::Log,
            Target::Pack => FinalizeTarget::Pack,
        }
    }
}

#[derive(Args)]
pub struct VerifyArgs {
    /// Move packs that fail to open into `packs/corrupt/`
    #[arg(long)]
    pub quarantine: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rvs", "stats", "--store", "/tmp/s", "--format", "json", "-vv",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Stats));
        assert_eq!(cli.store.local, Some(PathBuf::from("/tmp/s")));
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn delta_requires_p1() {
        assert!(Cli::try_parse_from(["rvs", "add", "a.txt", "a.txt", "--delta"]).is_err());
        let cli = Cli::try_parse_from([
            "rvs", "add", "a.txt", "a.txt", "--delta", "--p1", "00", "--to", "pack",
        ])
        .unwrap();
        let Command::Add(args) = cli.command else {
            panic!("expected add");
        };
        assert_eq!(FinalizeTarget::from(args.target.unwrap()), FinalizeTarget::Pack);
    }
}
