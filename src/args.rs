use std::path::PathBuf;

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, clap::Parser)]
pub struct ServeCommand {
    /// Public address of this node (HOST:PORT). Presence makes it a master.
    #[arg(long)]
    pub address: Option<String>,
}

#[derive(Debug, clap::Parser)]
pub enum Command {
    /// Start a dispatcher node.
    Serve(ServeCommand),
    /// Start a cache-only node (no workers, no job database).
    ServeCache,
    /// Create the database and the datasource and queue tables.
    Init,
}

#[derive(Debug, clap::Parser)]
#[command(name = NAME, version = VERSION)]
pub struct Args {
    /// Path to the config file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Enable increasingly more verbose output
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}
