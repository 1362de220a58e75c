use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "kueue-jobset", about = "Queue-managed JobSet integration")]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub(crate) subcommand: SubCommands,

    #[clap(
        short,
        long,
        default_value = "/etc/kueue-jobset/config.yaml",
        global = true
    )]
    pub(crate) config: PathBuf,
}

#[derive(Debug, Clone, Subcommand)]
pub(crate) enum SubCommands {
    /// Run the controllers until SIGINT or SIGTERM.
    Run {},

    /// List the registered integrations.
    Integrations {},

    /// Show how a manifest looks to its integration.
    Inspect {
        #[clap(short, long)]
        manifest: PathBuf,
    },
}
