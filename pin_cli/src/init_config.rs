use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Subcommand;
use rand::RngCore;
use toml_edit::{DocumentMut, Item, Table};
use tracing::info;

#[derive(Subcommand)]
pub enum CmdConfig {
    /// Creates node config file if it doesn't exist and generates a keypair
    Init,
}

fn table<'a>(doc: &'a mut DocumentMut, key: &str) -> anyhow::Result<&'a mut Table> {
    doc.entry(key)
        .or_insert(Item::Table(Table::new()))
        .as_table_mut()
        .with_context(|| format!("[{key}] in node config is not a table"))
}

fn random_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl CmdConfig {
    pub fn run(self, node: &str, node_config_file: PathBuf, local_data_dir: &Path) -> anyhow::Result<()> {
        let config_dir = node_config_file
            .parent()
            .context("node config file has no parent directory")?;
        let mut doc = if node_config_file.exists() {
            fs::read_to_string(&node_config_file)?
        } else {
            fs::create_dir_all(config_dir)?;
            "".to_owned()
        }
        .parse::<DocumentMut>()
        .context("could not parse node config file")?;

        match self {
            Self::Init => {
                let secretkey_file = node_config_file.with_extension("secretkey");
                let secretkey_name = secretkey_file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .context("secret key file name is not valid UTF-8")?
                    .to_owned();

                let identity = table(&mut doc, "identity")?;
                if !identity.contains_key("secret_key") {
                    identity.insert("secret_key_file", secretkey_name.into());
                }

                let cluster = table(&mut doc, "cluster")?;
                if !cluster.contains_key("secret") {
                    info!("generating random cluster secret");
                    cluster.insert("secret", random_hex().into());
                }

                let ledger_path = local_data_dir.join("ledgers").join(node);
                let ledger = table(&mut doc, "ledger")?;
                if !ledger.contains_key("type") {
                    ledger.insert("type", "redb".into());
                    ledger.insert(
                        "path",
                        ledger_path
                            .to_str()
                            .context("ledger path is not valid UTF-8")?
                            .into(),
                    );
                }

                let block_store = table(&mut doc, "block_store")?;
                if !block_store.contains_key("data_dir") {
                    block_store.insert(
                        "data_dir",
                        local_data_dir
                            .to_str()
                            .context("data path is not valid UTF-8")?
                            .into(),
                    );
                }

                if !secretkey_file.exists() {
                    info!("generating secure random secret key for node");
                    let mut bytes = [0u8; 32];
                    rand::rng().fill_bytes(&mut bytes);
                    fs::write(secretkey_file, bytes)?;
                }
            }
        }

        info!("writing to config file {node_config_file:?}");

        let tmp_path = node_config_file.with_extension("tmp");
        let mut tmp = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(doc.to_string().as_bytes())?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, node_config_file)?;
        Ok(())
    }
}
