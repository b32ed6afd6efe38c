use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub struct Config {
    /// Client-side durable mutation queue.
    pub queue_path: PathBuf,
    /// Server store used by `serve` and `admin`.
    pub server_db_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "nestling").context("Could not determine home directory")?;
        Self::in_dir(proj_dirs.data_dir().to_path_buf())
    }

    pub fn in_dir(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Config {
            queue_path: data_dir.join("queue.db"),
            server_db_path: data_dir.join("server.db"),
            data_dir,
        })
    }

    fn token_path(&self) -> PathBuf {
        self.data_dir.join("token")
    }

    /// Bearer token saved by `admin add-caller --save`, if any.
    pub fn saved_token(&self) -> Result<Option<String>> {
        let path = self.token_path();
        if !path.exists() {
            return Ok(None);
        }
        let token = std::fs::read_to_string(&path).context("Failed to read token file")?;
        let token = token.trim().to_string();
        Ok((!token.is_empty()).then_some(token))
    }

    pub fn save_token(&self, token: &str) -> Result<PathBuf> {
        let path = self.token_path();
        std::fs::write(&path, token).context("Failed to write token file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set token file permissions")?;
        }
        Ok(path)
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    use rand::Rng;
    use std::fmt::Write;

    let bytes: [u8; 32] = rand::rng().random();
    bytes
        .iter()
        .fold(String::with_capacity(64), |mut acc: String, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_shape() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_roundtrip_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::in_dir(dir.path().join("nested")).unwrap();
        assert!(config.saved_token().unwrap().is_none());
        assert!(config.queue_path.ends_with("queue.db"));

        config.save_token("abc123\n").unwrap();
        assert_eq!(config.saved_token().unwrap().as_deref(), Some("abc123"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(config.data_dir.join("token"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
