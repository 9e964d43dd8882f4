use std::{
    fs, io,
    path::{Path, PathBuf},
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const IDENTITY_FILE: &str = "identity.json";

/// Tight bound: the identity file holds two short strings.
const MAX_IDENTITY_BYTES: u64 = 4 * 1024;

const ID_LENGTH: usize = 8;
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

const ADJECTIVES: [&str; 5] = ["快乐的", "勇敢的", "聪明的", "神秘的", "活泼的"];
const NOUNS: [&str; 5] = ["猫咪", "狐狸", "老虎", "小鸟", "开发者"];

/// The persisted (id, display-name) pair. Stable across reloads, immutable
/// for the lifetime of a session, regenerated only on explicit reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userName")]
    pub user_name: String,
}

pub fn generate() -> Identity {
    let mut rng = rand::rng();
    let user_id: String = (0..ID_LENGTH)
        .map(|_| ID_CHARSET[rng.random_range(0..ID_CHARSET.len())] as char)
        .collect();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    Identity {
        user_id,
        user_name: format!("{adjective}{noun}"),
    }
}

pub fn identity_path(data_dir: &Path) -> PathBuf {
    data_dir.join(IDENTITY_FILE)
}

/// Load a persisted identity, treating anything unusable as absent.
pub fn load_from_path(path: &Path) -> Option<Identity> {
    let meta = fs::metadata(path).ok()?;
    if meta.len() > MAX_IDENTITY_BYTES {
        warn!(path = %path.display(), size = meta.len(), "identity file too large, ignoring");
        return None;
    }
    let data = fs::read_to_string(path).ok()?;
    let identity: Identity = serde_json::from_str(&data).ok()?;
    if identity.user_id.trim().is_empty() || identity.user_name.trim().is_empty() {
        return None;
    }
    Some(identity)
}

pub fn save_to_path(path: &Path, identity: &Identity) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(identity)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload.as_bytes())?;
    fs::rename(&tmp, path)
}

/// Resolve the session identity: reuse the persisted pair, or generate and
/// persist a fresh one if either half is missing or unreadable. A storage
/// write failure degrades to an in-memory identity rather than failing.
pub fn resolve(path: &Path) -> Identity {
    if let Some(identity) = load_from_path(path) {
        return identity;
    }
    let fresh = generate();
    if let Err(err) = save_to_path(path, &fresh) {
        warn!(path = %path.display(), "identity not persisted, using in-memory identity: {err}");
    }
    fresh
}

/// Discard the persisted identity so the next resolve regenerates it.
pub fn reset(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_short_lowercase_alphanumeric() {
        let identity = generate();
        assert_eq!(identity.user_id.len(), ID_LENGTH);
        assert!(
            identity
                .user_id
                .bytes()
                .all(|b| ID_CHARSET.contains(&b))
        );
    }

    #[test]
    fn generated_name_comes_from_the_word_sets() {
        let identity = generate();
        assert!(
            ADJECTIVES
                .iter()
                .any(|adj| identity.user_name.starts_with(adj))
        );
        assert!(NOUNS.iter().any(|noun| identity.user_name.ends_with(noun)));
    }

    #[test]
    fn two_generated_identities_differ() {
        assert_ne!(generate().user_id, generate().user_id);
    }
}
