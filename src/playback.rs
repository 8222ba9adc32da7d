use anyhow::{Context, Result, bail};
use std::path::Path;

/// Hand an audio file to the operating system's default player
pub fn open_with_default_player(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("Audio file not found: {}", path.display());
    }

    open::that(path)
        .with_context(|| format!("Failed to open {} with the default player", path.display()))?;

    Ok(())
}
