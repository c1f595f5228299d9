use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pin_node::config::PinNodeConfig;

mod pins;

pub use pins::run_pins;

pub fn load_config(node_config_file: &Path) -> Result<PinNodeConfig> {
    let toml_content = std::fs::read_to_string(node_config_file).with_context(|| {
        format!("failed to read {node_config_file:?}, run `pinc config init` first")
    })?;
    Ok(toml::from_str(&toml_content)?)
}

pub async fn run_command(
    cli_node: &str,
    node_config_file: PathBuf,
    local_data_dir: &Path,
    cmd: crate::Commands,
) -> Result<()> {
    match cmd {
        crate::Commands::Config { cmd } => cmd.run(cli_node, node_config_file, local_data_dir),
        crate::Commands::Start => {
            let config = load_config(&node_config_file)?;
            pin_node::run_node(node_config_file, config).await
        }
        crate::Commands::Id => {
            let config = load_config(&node_config_file)?;
            let secret_key =
                pin_node::identity::load_secret_key(&config.identity, node_config_file.parent())
                    .context("no usable secret key in node config")?;
            println!("{}", pin_node::identity::peer_id(&secret_key));
            Ok(())
        }
        crate::Commands::Pins { cmd } => {
            let config = load_config(&node_config_file)?;
            run_pins(cmd, &config, &node_config_file).await
        }
    }
}
