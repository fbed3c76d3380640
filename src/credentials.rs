//! Secret lookup for the upstream services.
//!
//! Keys are resolved from `<base>/.env` first, then the process
//! environment, and for the catalog token finally `<base>/token.txt`.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use crate::config::ConfigError;

pub const GOOGLE_API_KEY: &str = "GOOGLE_API_KEY";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const WS_TOKEN: &str = "WS_TOKEN";

const DOTENV_FILE: &str = ".env";
const TOKEN_FILE: &str = "token.txt";

pub fn lookup(base_path: &Path, key: &str) -> Option<String> {
    if let Some(value) = read_dotenv(base_path).remove(key) {
        if !value.is_empty() {
            return Some(value);
        }
    }

    if let Ok(value) = std::env::var(key) {
        let value = value.trim().to_string();
        if !value.is_empty() {
            return Some(value);
        }
    }

    if key == WS_TOKEN {
        if let Ok(value) = std::fs::read_to_string(base_path.join(TOKEN_FILE)) {
            let value = value.trim().to_string();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    None
}

pub fn require(base_path: &Path, key: &'static str) -> Result<String, ConfigError> {
    lookup(base_path, key).ok_or(ConfigError::MissingCredential(key))
}

/// Persist the catalog token into `.env` (keeping other keys) and `token.txt`.
pub fn save_token(base_path: &Path, token: &str) -> io::Result<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "token must not be empty",
        ));
    }

    std::fs::create_dir_all(base_path)?;

    let mut entries = read_dotenv(base_path);
    entries.insert(WS_TOKEN.to_string(), token.to_string());

    let mut dotenv = String::new();
    for (key, value) in &entries {
        dotenv.push_str(&format!("{key}={value}\n"));
    }

    write_private(&base_path.join(DOTENV_FILE), &dotenv)?;
    write_private(&base_path.join(TOKEN_FILE), token)?;

    log::info!("catalog token saved to {}", base_path.display());

    Ok(())
}

fn read_dotenv(base_path: &Path) -> BTreeMap<String, String> {
    let Ok(content) = std::fs::read_to_string(base_path.join(DOTENV_FILE)) else {
        return BTreeMap::new();
    };

    parse_dotenv(&content)
}

fn parse_dotenv(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(content.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> io::Result<()> {
    std::fs::write(path, content)
}
