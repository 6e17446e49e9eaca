use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const KEYSTORE_DIR: &str = ".parity-server";
const KEYSTORE_FILE: &str = "keystore.json";

/// The locally stored wallet key.
#[derive(Serialize, Deserialize)]
pub struct Keystore {
    pub private_key: String,
}

pub fn default_path() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("Unable to resolve home directory")?;
    Ok(home.join(KEYSTORE_DIR).join(KEYSTORE_FILE))
}

pub fn parse_private_key(private_key: &str) -> anyhow::Result<PrivateKeySigner> {
    let bytes = hex::decode(private_key.trim_start_matches("0x")).context("private key is not valid hex")?;
    if bytes.len() != 32 {
        bail!("private key must be 64 hex characters");
    }
    PrivateKeySigner::from_slice(&bytes).context("invalid private key")
}

pub fn store(path: &Path, private_key: &str) -> anyhow::Result<()> {
    parse_private_key(private_key)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create keystore directory")?;
    }
    let keystore = Keystore { private_key: private_key.into() };
    let contents = serde_json::to_string_pretty(&keystore)?;
    fs::write(path, contents).context("Failed to write keystore")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).context("Failed to restrict keystore permissions")?;
    }
    Ok(())
}

pub fn load(path: &Path) -> anyhow::Result<Keystore> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read keystore at {}, run `auth` first", path.display()))?;
    let keystore = serde_json::from_str(&contents).context("Malformed keystore")?;
    Ok(keystore)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("keystore.json");
        let private_key = "11".repeat(32);
        store(&path, &private_key).expect("failed to store");

        let keystore = load(&path).expect("failed to load");
        assert_eq!(keystore.private_key, private_key);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn rejects_malformed_keys() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("keystore.json");
        store(&path, "not-hex").expect_err("stored invalid key");
        store(&path, "ab").expect_err("stored short key");
        assert!(!path.exists());
    }

    #[test]
    fn key_parsing_accepts_prefixed_hex() {
        let key = format!("0x{}", "11".repeat(32));
        parse_private_key(&key).expect("failed to parse");
    }
}
