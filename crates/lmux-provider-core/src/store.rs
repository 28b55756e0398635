use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::auth::Auth;

/// Where auth entries persist. The registry calls through this; `FileStore`
/// is the shipping implementation, tests substitute their own.
pub trait AuthStore: Send + Sync {
    fn save(&self, auth: &Auth) -> io::Result<()>;
    fn delete(&self, auth: &Auth) -> io::Result<()>;
    fn load_all(&self) -> io::Result<Vec<Auth>>;
}

/// One JSON file per auth under the auth directory, `0600` on unix.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, auth: &Auth) -> PathBuf {
        let name = if auth.file_name.is_empty() {
            let label = if auth.label.is_empty() {
                auth.id.as_str()
            } else {
                auth.label.as_str()
            };
            format!("{}-{}.json", auth.provider, sanitize_file_stem(label))
        } else {
            auth.file_name.clone()
        };
        self.dir.join(name)
    }
}

fn sanitize_file_stem(stem: &str) -> String {
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn restrict_permissions(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

impl AuthStore for FileStore {
    fn save(&self, auth: &Auth) -> io::Result<()> {
        let path = self.path_for(auth);
        let payload = serde_json::to_vec_pretty(auth)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(&path, payload)?;
        restrict_permissions(&path)
    }

    fn delete(&self, auth: &Auth) -> io::Result<()> {
        let path = self.path_for(auth);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn load_all(&self) -> io::Result<Vec<Auth>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<Auth>(&bytes) {
                Ok(mut auth) => {
                    if auth.file_name.is_empty()
                        && let Some(name) = path.file_name().and_then(|n| n.to_str())
                    {
                        auth.file_name = name.to_string();
                    }
                    out.push(auth);
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable auth file");
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let mut auth = Auth::new("claude", "c1");
        auth.label = "work account".into();
        auth.metadata.access_token = "tok".into();
        store.save(&auth).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "c1");
        assert_eq!(loaded[0].metadata.access_token, "tok");
        assert_eq!(loaded[0].file_name, "claude-work_account.json");
    }

    #[cfg(unix)]
    #[test]
    fn saved_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let auth = Auth::new("gemini", "g1");
        store.save(&auth).unwrap();

        let path = dir.path().join("gemini-g1.json");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
