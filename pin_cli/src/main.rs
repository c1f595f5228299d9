use crate::init_config::CmdConfig;
use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use directories::ProjectDirs;

mod cmd;
mod init_config;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// which pin node this command should run on
    #[arg(short, long, value_name = "NAME", default_value = "local")]
    node: String,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modify the node's config
    Config {
        #[command(subcommand)]
        cmd: CmdConfig,
    },
    /// Start the node and run until Ctrl-C
    Start,
    /// Print this node's peer id
    Id,
    /// Inspect the node's local pin ledger
    Pins {
        #[command(subcommand)]
        cmd: PinsCmd,
    },
}

#[derive(Subcommand)]
enum PinsCmd {
    /// List pins, newest first
    List {
        /// max number of pins to print
        #[arg(short, long, value_name = "COUNT", default_value_t = 50)]
        limit: usize,
    },
    /// Print one pin record as JSON
    Show { cid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    // Configs live under ~/.config/pinc/<node>.toml, data under
    // ~/.local/share/pinc/.
    let dirs =
        ProjectDirs::from("", "", "pinc").context("failed to determine config directory path")?;
    let node_config_file = dirs.config_dir().join(&cli.node).with_extension("toml");
    let local_data_dir = dirs.data_dir();

    cmd::run_command(&cli.node, node_config_file, local_data_dir, cli.cmd).await
}
