use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        let mut creds = Self {
            access_token: Some(access_token.into()),
        };
        creds.normalize();
        creds
    }

    fn normalize(&mut self) {
        self.access_token = self.access_token.as_ref().map(|s| s.trim().to_string());
        if matches!(self.access_token.as_deref(), Some(s) if s.is_empty()) {
            self.access_token = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn credentials_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("pubforge").join("credentials.json"))
}

pub fn load_credentials(path: &Path) -> anyhow::Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut creds: Credentials = serde_json::from_str(&raw)?;
    creds.normalize();
    Ok(Some(creds))
}

pub fn save_credentials(path: &Path, creds: &Credentials) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid credentials path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut creds = creds.clone();
    creds.normalize();

    let json = serde_json::to_string_pretty(&creds)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

pub fn clear_credentials(path: &Path) -> anyhow::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    std::fs::remove_file(path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_trims_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        save_credentials(&path, &Credentials::new("  tok-123 \n")).unwrap();
        let loaded = load_credentials(&path).unwrap().unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("tok-123"));
    }

    #[test]
    fn blank_token_normalizes_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"access_token":"   "}"#).unwrap();

        let loaded = load_credentials(&path).unwrap().unwrap();
        assert_eq!(loaded.access_token, None);
    }

    #[test]
    fn missing_file_is_none_and_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        assert!(load_credentials(&path).unwrap().is_none());
        assert!(!clear_credentials(&path).unwrap());

        save_credentials(&path, &Credentials::new("abc")).unwrap();
        assert!(clear_credentials(&path).unwrap());
        assert!(!path.exists());
    }
}
