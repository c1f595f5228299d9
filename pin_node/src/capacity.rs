use pin_protocol::PeerInfo;
use std::path::PathBuf;

const MIB: u64 = 1024 * 1024;

/// Where a peer's capacity reports come from.
#[derive(Debug, Clone)]
pub enum CapacitySource {
    /// Measure the filesystem holding this directory.
    Disk(PathBuf),
    /// Report fixed numbers, in MiB.
    Fixed { total_mb: u64, free_mb: u64 },
}

impl CapacitySource {
    pub async fn measure(&self) -> std::io::Result<PeerInfo> {
        match self {
            CapacitySource::Disk(dir) => {
                let dir = dir.clone();
                tokio::task::spawn_blocking(move || {
                    let total = fs4::total_space(&dir)?;
                    let free = fs4::available_space(&dir)?;
                    Ok(PeerInfo::new(total / MIB, free / MIB))
                })
                .await
                .map_err(std::io::Error::other)?
            }
            CapacitySource::Fixed { total_mb, free_mb } => Ok(PeerInfo::new(*total_mb, *free_mb)),
        }
    }
}
