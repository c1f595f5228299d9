use base64::Engine;
use ed25519_dalek::SigningKey;
use pin_core::PeerId;
use std::path::Path;

/// Load the node's secret key from config.
///
/// The `config_dir` should be the directory containing the config file,
/// used to resolve relative `secret_key_file` paths.
pub fn load_secret_key(
    identity: &crate::config::NodeConfigIdentity,
    config_dir: Option<&Path>,
) -> Option<SigningKey> {
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
    parse_secret_key_bytes(&bytes)
}

pub fn parse_secret_key_string(s: &str) -> Option<SigningKey> {
    let s = s.trim();
    if let Ok(bytes) = hex::decode(s)
        && let Some(sk) = parse_secret_key_bytes(&bytes)
    {
        return Some(sk);
    }
    if let Ok(bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s)
        && let Some(sk) = parse_secret_key_bytes(&bytes)
    {
        return Some(sk);
    }
    None
}

pub fn parse_secret_key_bytes(bytes: &[u8]) -> Option<SigningKey> {
    let bytes: &[u8; 32] = bytes.try_into().ok()?;
    Some(SigningKey::from_bytes(bytes))
}

/// The address this node asserts when authenticating.
pub fn peer_id(key: &SigningKey) -> PeerId {
    PeerId::from_public_key(&key.verifying_key())
}
