//! IPC authentication and process identity.
//!
//! Every request frame carries a shared token. The token lives in a file
//! created at install time (`fanguard token generate`, mode `0600`) and is
//! read by both the daemon and authorized clients.
//!
//! Per-request verification follows a type-state lifecycle so request
//! handlers can only be reached with a verified session:
//!
//! ```text
//! PeerSession<Unauthenticated>
//!     → .authenticate(token)      // constant-time comparison
//!         → PeerSession<Authenticated>
//! ```
//!
//! [`LocalIdentity`] detects the OS user of the daemon itself and backs the
//! startup privilege check.

use std::fmt;
use std::marker::PhantomData;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Random bytes in a generated token.
const TOKEN_BYTES: usize = 32;

/// Errors from token handling and request authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("presented token does not match")]
    TokenMismatch,

    #[error("token file {} is empty", path.display())]
    EmptyToken { path: PathBuf },

    #[error("token file {} already exists (use --force to replace it)", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("failed to access token file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Shared IPC secret. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IpcToken(String);

impl IpcToken {
    /// Fresh random token: 256 bits from the OS RNG, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = Self(hex::encode(bytes));
        bytes.zeroize();
        token
    }

    /// Wrap an existing secret, trimming surrounding whitespace.
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let mut raw: String = secret.into();
        let trimmed = raw.trim().to_string();
        raw.zeroize();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed))
        }
    }

    /// The secret, for placing in an outgoing request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compare against a presented token in constant time.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Read the token file.
    pub async fn load(path: &Path) -> Result<Self, AuthError> {
        let io_err = |source: std::io::Error| AuthError::Io {
            path: path.to_path_buf(),
            source,
        };
        let meta = tokio::fs::metadata(path).await.map_err(io_err)?;
        if meta.permissions().mode() & 0o007 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{:o}", meta.permissions().mode() & 0o777),
                "IPC token file is accessible to other users"
            );
        }
        let content = tokio::fs::read_to_string(path).await.map_err(io_err)?;
        Self::new(content).ok_or_else(|| AuthError::EmptyToken {
            path: path.to_path_buf(),
        })
    }

    /// Write the token to `path` with mode `0600`. Refuses to replace an
    /// existing file unless `force` is set.
    pub async fn write(&self, path: &Path, force: bool) -> Result<(), AuthError> {
        use tokio::io::AsyncWriteExt;

        let io_err = |source: std::io::Error| AuthError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).mode(0o600);
        if force {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = match options.open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(AuthError::AlreadyExists {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(io_err(e)),
        };
        // A pre-existing file keeps its old mode on open.
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;

        let mut line = format!("{}\n", self.0);
        let written = file.write_all(line.as_bytes()).await;
        line.zeroize();
        written.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

impl fmt::Debug for IpcToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IpcToken([REDACTED])")
    }
}

/// The local OS identity of the current process owner.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// OS username (e.g. "fanguard", "root").
    pub username: String,
    /// Numeric user ID.
    pub uid: u32,
    /// Numeric group ID.
    pub gid: u32,
    /// Whether this identity has elevated privileges (uid == 0).
    pub is_privileged: bool,
}

impl LocalIdentity {
    /// Detect the identity of the current process owner from
    /// `/proc/self/status`, falling back to `u32::MAX` when unreadable.
    pub fn detect() -> Self {
        let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
        let uid = Self::status_field(&status, "Uid:");
        let gid = Self::status_field(&status, "Gid:");
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| format!("uid:{uid}"));

        Self {
            is_privileged: uid == 0,
            username,
            uid,
            gid,
        }
    }

    /// Construct a `LocalIdentity` from explicit values (for testing).
    pub fn from_parts(username: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            is_privileged: uid == 0,
            username: username.into(),
            uid,
            gid,
        }
    }

    /// Effective id from a `/proc/<pid>/status` line such as
    /// `Uid:\t1000\t1000\t1000\t1000`.
    fn status_field(status: &str, key: &str) -> u32 {
        status
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(2))
            .and_then(|id| id.parse().ok())
            .unwrap_or(u32::MAX)
    }
}

/// Credentials of the process on the other end of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub uid: Option<u32>,
    pub pid: Option<i32>,
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.uid, self.pid) {
            (Some(uid), Some(pid)) => write!(f, "uid={uid} pid={pid}"),
            (Some(uid), None) => write!(f, "uid={uid}"),
            _ => f.write_str("unknown peer"),
        }
    }
}

/// Unauthenticated state: the request's token has not been checked.
pub struct Unauthenticated;

/// Authenticated state: the request carried the shared token.
pub struct Authenticated;

/// Per-request session parameterized by its verification state.
pub struct PeerSession<S> {
    peer: PeerInfo,
    _state: PhantomData<S>,
}

impl PeerSession<Unauthenticated> {
    pub fn new(peer: PeerInfo) -> Self {
        Self {
            peer,
            _state: PhantomData,
        }
    }

    /// Verify the presented token.
    pub fn authenticate(
        self,
        presented: &str,
        expected: &IpcToken,
    ) -> Result<PeerSession<Authenticated>, AuthError> {
        if !expected.matches(presented) {
            return Err(AuthError::TokenMismatch);
        }
        Ok(PeerSession {
            peer: self.peer,
            _state: PhantomData,
        })
    }
}

impl<S> PeerSession<S> {
    pub fn peer(&self) -> PeerInfo {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_generate_is_unique_hex() {
        let a = IpcToken::generate();
        let b = IpcToken::generate();
        assert_eq!(a.expose().len(), 64);
        assert!(a.expose().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn test_new_trims_and_rejects_empty() {
        let token = IpcToken::new("  secret\n").unwrap();
        assert_eq!(token.expose(), "secret");
        assert!(IpcToken::new(" \n\t").is_none());
    }

    #[test]
    fn test_matches() {
        let token = IpcToken::new("abc123").unwrap();
        assert!(token.matches("abc123"));
        assert!(!token.matches("abc124"));
        assert!(!token.matches("abc12"));
        assert!(!token.matches("abc1234"));
        assert!(!token.matches(""));
    }

    #[test]
    fn test_debug_is_redacted() {
        let token = IpcToken::new("super-secret").unwrap();
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("etc/ipc.token");
        let token = IpcToken::generate();
        token.write(&path, false).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let loaded = IpcToken::load(&path).await.unwrap();
        assert_eq!(loaded.expose(), token.expose());
    }

    #[tokio::test]
    async fn test_write_refuses_overwrite_without_force() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ipc.token");
        IpcToken::generate().write(&path, false).await.unwrap();

        let second = IpcToken::generate();
        assert!(matches!(
            second.write(&path, false).await,
            Err(AuthError::AlreadyExists { .. })
        ));
        second.write(&path, true).await.unwrap();
        assert_eq!(
            IpcToken::load(&path).await.unwrap().expose(),
            second.expose()
        );
    }

    #[tokio::test]
    async fn test_force_write_tightens_mode() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ipc.token");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        IpcToken::generate().write(&path, true).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_load_errors() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing");
        assert!(matches!(
            IpcToken::load(&missing).await,
            Err(AuthError::Io { .. })
        ));

        let empty = tmp.path().join("empty");
        std::fs::write(&empty, "\n").unwrap();
        assert!(matches!(
            IpcToken::load(&empty).await,
            Err(AuthError::EmptyToken { .. })
        ));
    }

    #[test]
    fn test_session_authenticate() {
        let token = IpcToken::new("s3cret").unwrap();
        let peer = PeerInfo {
            uid: Some(1000),
            pid: Some(42),
        };
        let session = PeerSession::new(peer).authenticate("s3cret", &token).unwrap();
        assert_eq!(session.peer(), peer);
        assert_eq!(session.peer().to_string(), "uid=1000 pid=42");

        assert!(matches!(
            PeerSession::new(peer).authenticate("wrong", &token),
            Err(AuthError::TokenMismatch)
        ));
    }

    #[test]
    fn test_status_field_parsing() {
        let status = "Name:\tfanguard\nUid:\t1000\t0\t0\t0\nGid:\t100\t100\t100\t100\n";
        assert_eq!(LocalIdentity::status_field(status, "Uid:"), 0);
        assert_eq!(LocalIdentity::status_field(status, "Gid:"), 100);
        assert_eq!(LocalIdentity::status_field("", "Uid:"), u32::MAX);
    }

    #[test]
    fn test_local_identity_detect() {
        let identity = LocalIdentity::detect();
        assert!(!identity.username.is_empty());
        assert_eq!(identity.is_privileged, identity.uid == 0);
    }

    #[test]
    fn test_from_parts() {
        assert!(LocalIdentity::from_parts("root", 0, 0).is_privileged);
        assert!(!LocalIdentity::from_parts("alice", 1000, 1000).is_privileged);
    }
}
