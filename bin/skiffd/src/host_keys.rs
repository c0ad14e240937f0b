use std::{collections::HashMap, path::PathBuf};

use eyre::{Result, WrapErr};
use futures::{future::BoxFuture, FutureExt};
use skiff_tokio::HostKeyProvider;
use tracing::debug;

/// Reads base64 encoded host keys from files.
pub struct FileHostKeys {
    paths: HashMap<String, PathBuf>,
}

impl FileHostKeys {
    pub fn new(paths: HashMap<String, PathBuf>) -> Self {
        Self { paths }
    }
}

impl HostKeyProvider for FileHostKeys {
    fn host_keys(&self) -> BoxFuture<'_, Result<HashMap<String, String>>> {
        async move {
            let mut keys = HashMap::new();
            for (alg, path) in &self.paths {
                let key = tokio::fs::read_to_string(path)
                    .await
                    .wrap_err_with(|| format!("reading host key for {alg} at '{}'", path.display()))?;
                debug!(%alg, ?path, "Read host key");
                keys.insert(alg.clone(), key.trim().to_owned());
            }
            Ok(keys)
        }
        .boxed()
    }
}
