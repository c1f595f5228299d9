//! Pin I/O against the local block store.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error("Got HTTP {0} with content '{1}'")]
    HttpFailWithBody(u16, String),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Stores and releases content on behalf of the cluster.
#[async_trait]
pub trait PinExecutor: std::fmt::Debug + Send + Sync + 'static {
    /// Pins `cid` and returns its size in bytes.
    async fn pin(&self, cid: &str) -> Result<u64, ExecutorError>;

    async fn unpin(&self, cid: &str) -> Result<(), ExecutorError>;
}

/// Executor backed by a Kubo RPC endpoint.
#[derive(Debug, Clone)]
pub struct KuboExecutor {
    endpoint: String,
    reqwest_client: reqwest::Client,
}

#[derive(Deserialize)]
struct ObjectStat {
    #[serde(rename = "CumulativeSize")]
    cumulative_size: u64,
}

impl KuboExecutor {
    /// The endpoint is the node's own block store, so system proxy
    /// settings are ignored.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ExecutorError> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            reqwest_client: reqwest::Client::builder().no_proxy().build()?,
        })
    }

    async fn call(&self, method: &str, cid: &str) -> Result<String, ExecutorError> {
        let url = format!("{}/api/v0/{method}", self.endpoint);
        let res = self
            .reqwest_client
            .post(&url)
            .query(&[("arg", cid)])
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(ExecutorError::HttpFailWithBody(status.as_u16(), text));
        }
        Ok(text)
    }
}

#[async_trait]
impl PinExecutor for KuboExecutor {
    async fn pin(&self, cid: &str) -> Result<u64, ExecutorError> {
        self.call("pin/add", cid).await?;
        let stat: ObjectStat = serde_json::from_str(&self.call("object/stat", cid).await?)?;
        Ok(stat.cumulative_size)
    }

    async fn unpin(&self, cid: &str) -> Result<(), ExecutorError> {
        self.call("pin/rm", cid).await?;
        Ok(())
    }
}
