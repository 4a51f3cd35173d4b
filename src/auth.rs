//! Credentials handed to the helper
//!
//! OpenVPN reads `--auth-user-pass` files as two lines: username, then password.
//! [`AuthMaterial`] owns such a file for the duration of one connection attempt;
//! the file is created with 0600 permissions and removed on [`AuthMaterial::release`]
//! or drop, whichever comes first.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Configs without interactive auth are started without credentials
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// `username\npassword\n`, the format shared by auth files and helper stdin
    pub fn payload(&self) -> String {
        format!("{}\n{}\n", self.username, self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub struct AuthMaterial {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl AuthMaterial {
    /// Writes `credentials` to a new private file in `dir` (system temp dir if `None`).
    pub fn create(dir: Option<&Path>, credentials: &Credentials) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ovpn-auth-").suffix(".txt");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(credentials.payload().as_bytes())?;
        file.flush()?;

        let path = file.path().to_path_buf();
        debug!("Auth material written to {}", path.display());
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.file.is_none()
    }

    /// Unlinks the file. Safe to call more than once.
    pub fn release(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        match file.close() {
            Ok(()) => {
                debug!("Auth material removed: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove auth material {}: {}", self.path.display(), e);
                // Last attempt by path; the handle is already gone
                match std::fs::remove_file(&self.path) {
                    Err(e2) if e2.kind() != io::ErrorKind::NotFound => Err(e2),
                    _ => Ok(()),
                }
            }
        }
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMaterial")
            .field("path", &self.path)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for AuthMaterial {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
