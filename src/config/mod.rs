use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `[data]` block: where the corpus lives.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct DataConfig {
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub use_sample: bool,
    /// Published record count, lets streaming mode answer `len`.
    pub known_total: Option<usize>,
}

/// `[index]` block: turn offset index sidecar.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct IndexConfig {
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub build_async: bool,
}

/// `[remote]` block: HTTP mirror of the corpus files.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub token_command: Option<String>,
}

/// Top-level sporc config file structure.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct SporcConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub index: IndexConfig,
    pub remote: Option<RemoteConfig>,
}

impl SporcConfig {
    /// Load config from ~/.sporc/config.toml. Returns default if file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(SporcConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: SporcConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Display config with secrets redacted.
    pub fn display_redacted(&self) -> String {
        let mut lines = vec!["[data]".to_string()];
        if let Some(ref dir) = self.data.dir {
            lines.push(format!("  dir = \"{}\"", dir.display()));
        }
        lines.push(format!("  use_sample = {}", self.data.use_sample));
        if let Some(total) = self.data.known_total {
            lines.push(format!("  known_total = {total}"));
        }

        lines.push("[index]".to_string());
        if let Some(ref path) = self.index.path {
            lines.push(format!("  path = \"{}\"", path.display()));
        }
        lines.push(format!("  build_async = {}", self.index.build_async));

        if let Some(ref remote) = self.remote {
            lines.push("[remote]".to_string());
            if let Some(ref url) = remote.base_url {
                lines.push(format!("  base_url = \"{url}\""));
            }
            if let Some(ref token) = remote.token {
                lines.push(format!("  token = \"{}\"", redact(token)));
            }
            if let Some(ref cmd) = remote.token_command {
                lines.push(format!("  token_command = \"{cmd}\""));
            }
        }
        lines.join("\n")
    }
}

fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "****".to_string()
    }
}

/// Resolve the remote access token: CLI flag > env var > config token > config command.
///
/// `None` when nothing is configured; public mirrors need no token.
pub fn resolve_token(
    cli_flag: Option<&str>,
    env_var_name: &str,
    config: Option<&RemoteConfig>,
) -> Result<Option<String>> {
    if let Some(token) = cli_flag.filter(|t| !t.is_empty()) {
        return Ok(Some(token.to_string()));
    }

    if let Ok(val) = std::env::var(env_var_name) {
        if !val.is_empty() {
            return Ok(Some(val));
        }
    }

    let Some(rc) = config else {
        return Ok(None);
    };

    if let Some(token) = rc.token.as_ref().filter(|t| !t.is_empty()) {
        return Ok(Some(token.clone()));
    }

    if let Some(cmd) = rc.token_command.as_ref().filter(|c| !c.is_empty()) {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .with_context(|| format!("Failed to run token_command: {cmd}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "token_command failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let secret = String::from_utf8(output.stdout)
            .context("token_command output is not valid UTF-8")?
            .trim()
            .to_string();
        if !secret.is_empty() {
            return Ok(Some(secret));
        }
    }

    Ok(None)
}

/// Path to the config file: ~/.sporc/config.toml
pub fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".sporc").join("config.toml"))
}

/// Default config template content.
pub fn default_config_template() -> &'static str {
    r#"# ~/.sporc/config.toml
# Token resolution order: --token > SPORC_TOKEN > token > token_command

[data]
# dir = "/path/to/sporc"
# use_sample = false
# known_total = 1134058

[index]
# path = "/path/to/sporc/.sporc/turn_index.db"
# build_async = false

[remote]
# base_url = "https://example.org/sporc"
# token = "your-access-token"
# token_command = "your-secrets-manager-command-here"
"#
}

/// Create the default config file if it doesn't already exist.
pub fn init_config() -> Result<bool> {
    let path = config_path()?;
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, default_config_template())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_template_parses() {
        let config: SporcConfig = toml::from_str(default_config_template()).unwrap();
        assert!(config.data.dir.is_none());
        assert!(!config.index.build_async);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[data]\ndir = \"/corpus\"\nknown_total = 42\n\n[remote]\ntoken = \"abcdefghijkl\"\n",
        )
        .unwrap();

        let config = SporcConfig::load_from(&path).unwrap();
        assert_eq!(config.data.dir.as_deref(), Some(std::path::Path::new("/corpus")));
        assert_eq!(config.data.known_total, Some(42));

        let shown = config.display_redacted();
        assert!(shown.contains("abcd...ijkl"));
        assert!(!shown.contains("abcdefghijkl"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = SporcConfig::load_from(&dir.path().join("none.toml")).unwrap();
        assert!(config.remote.is_none());
    }

    #[test]
    fn test_token_chain_prefers_cli_then_config() {
        let rc = RemoteConfig {
            token: Some("from-config".into()),
            token_command: Some("echo from-command".into()),
            ..Default::default()
        };
        let env = "SPORC_TEST_TOKEN_UNSET";
        assert_eq!(
            resolve_token(Some("cli"), env, Some(&rc)).unwrap().as_deref(),
            Some("cli")
        );
        assert_eq!(
            resolve_token(None, env, Some(&rc)).unwrap().as_deref(),
            Some("from-config")
        );

        let cmd_only = RemoteConfig {
            token_command: Some("echo from-command".into()),
            ..Default::default()
        };
        assert_eq!(
            resolve_token(None, env, Some(&cmd_only)).unwrap().as_deref(),
            Some("from-command")
        );
        assert_eq!(resolve_token(None, env, None).unwrap(), None);
    }
}
