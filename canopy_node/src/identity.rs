use std::path::Path;

use base64::Engine;
use canopy_core::keys::KEY_SIZE;
use iroh::SecretKey;

use crate::config::NodeConfigIdentity;

/// Load the device's secret key from config.
///
/// The `config_dir` should be the directory containing the config file,
/// used to resolve relative `secret_key_file` paths.
pub fn load_secret_key(
    identity: &NodeConfigIdentity,
    config_dir: Option<&Path>,
) -> Option<SecretKey> {
    // Prefer inline key over file
    if let Some(s) = &identity.secret_key
        && let Some(sk) = parse_secret_key_string(s)
    {
        return Some(sk);
    }
    let path = Path::new(identity.secret_key_file.as_ref()?);
    let resolved = match config_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    };
    let bytes = std::fs::read(&resolved).ok()?;
    if let Ok(s) = std::str::from_utf8(&bytes)
        && let Some(sk) = parse_secret_key_string(s)
    {
        return Some(sk);
    }
    parse_key_bytes(&bytes).map(|b| SecretKey::from_bytes(&b))
}

pub fn parse_secret_key_string(s: &str) -> Option<SecretKey> {
    parse_key_string(s).map(|b| SecretKey::from_bytes(&b))
}

/// Parses a 32 byte key written as hex or unpadded url-safe base64.
pub fn parse_key_string(s: &str) -> Option<[u8; KEY_SIZE]> {
    let s = s.trim();
    if let Ok(bytes) = hex::decode(s)
        && let Some(key) = parse_key_bytes(&bytes)
    {
        return Some(key);
    }
    if let Ok(bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s)
        && let Some(key) = parse_key_bytes(&bytes)
    {
        return Some(key);
    }
    None
}

pub fn parse_key_bytes(bytes: &[u8]) -> Option<[u8; KEY_SIZE]> {
    bytes.try_into().ok()
}
