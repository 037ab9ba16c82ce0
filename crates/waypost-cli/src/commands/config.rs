//! Config command - show, check, and create the configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::cli::ConfigAction;
use crate::config::Config;
use crate::util::write_output;

/// Execute the config command against the file at `path`.
pub fn cmd_config(action: ConfigAction, path: &Path, output: Option<&PathBuf>) -> Result<()> {
    let content = match action {
        ConfigAction::Path => format!("{}\n", path.display()),
        ConfigAction::Show => {
            let config = Config::load_from(path);
            let body = toml::to_string_pretty(&config).context("Failed to serialize config")?;
            let origin = if path.exists() {
                path.display().to_string()
            } else {
                format!("{} (not found, showing defaults)", path.display())
            };
            format!("# {}\n{}", origin, body)
        }
        ConfigAction::Validate => {
            let config = load_strict(path)?;
            let tracking = config.validate()?;
            let body = toml::to_string_pretty(&tracking)
                .context("Failed to serialize tracking config")?;
            format!(
                "Configuration OK. Effective tracking config:\n\n{}\nDatabase: {}\n",
                body,
                config.db_path().display()
            )
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "Config file already exists: {}. Use --force to overwrite",
                    path.display()
                );
            }
            Config::initial().save_to(path)?;
            format!("Wrote {}\n", path.display())
        }
    };
    write_output(output, &content)
}

/// Load the file, failing on parse errors instead of falling back to defaults.
fn load_strict(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config: {}", path.display()))
}
