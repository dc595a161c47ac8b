//! Utility functions
//!
use std::{
    fs::File,
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<std::path::Path>,
) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;

    let mut file = File::create(filepath)?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;

    Ok(())
}

/// Find the model file.
///
/// An existing `model_path` is used as is. Otherwise, if a URL is given, the model is looked up in
/// the user cache directory and downloaded there on first use.
pub async fn resolve_model_path(model_path: &Path, model_url: Option<&str>) -> Result<PathBuf> {
    if model_path.exists() {
        return Ok(model_path.to_owned());
    }

    let url = model_url.ok_or_else(|| {
        anyhow!(
            "model file {} not found and no download URL given",
            model_path.display()
        )
    })?;

    let cache_dir = dirs::cache_dir()
        .ok_or_else(|| anyhow!("no cache directory available"))?
        .join("sign_server");
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create {}", cache_dir.display()))?;

    let filename = model_path
        .file_name()
        .ok_or_else(|| anyhow!("model path {} has no file name", model_path.display()))?;
    let cached = cache_dir.join(filename);

    if !cached.exists() {
        log::info!("Downloading model from {} to {}", url, cached.display());
        let partial = cached.with_extension("part");
        download_file(&Client::new(), url, &partial)
            .await
            .with_context(|| format!("failed to download model from {url}"))?;
        std::fs::rename(&partial, &cached)?;
    }

    Ok(cached)
}
