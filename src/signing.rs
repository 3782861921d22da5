//! Signed (CMS) documents: PKI tokens and the revocation list.
//!
//! Verification needs the identity service's signing certificate and its CA
//! on disk in the [`SigningDir`]. They are fetched lazily the first time a
//! verification reports them missing, then verification is retried once.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::admin_token::AdminTokenManager;
use crate::identity::{IdentityApi, VersionSelector};
use crate::{Error, Result};

/// Signing certificate file name
pub const SIGNING_CERT_FILE: &str = "signing_cert.pem";
/// CA certificate file name
pub const CA_CERT_FILE: &str = "cacert.pem";
/// Persisted revocation list file name
pub const REVOKED_FILE: &str = "revoked.json";

/// Base64 of a DER SEQUENCE with a long-form length, the start of every
/// CMS token
const SIGNED_TOKEN_PREFIX: &str = "MII";

/// Whether `token` is a signed document rather than an opaque id
#[must_use]
pub fn is_signed_token(token: &str) -> bool {
    token.starts_with(SIGNED_TOKEN_PREFIX)
}

/// Rebuild PEM armor around a token-encoded CMS blob (`/` travels as `-`)
#[must_use]
pub fn token_to_cms_pem(token: &str) -> String {
    let body = token.replace('-', "/");
    let mut pem = String::with_capacity(body.len() + body.len() / 64 + 40);
    pem.push_str("-----BEGIN CMS-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CMS-----\n");
    pem
}

/// Verification failures
#[derive(Debug, thiserror::Error)]
pub enum CmsError {
    /// Signing or CA certificate not present locally
    #[error("signing certificates are not available")]
    MissingCertificates,
    /// Bad signature, untrusted signer, or not a CMS document
    #[error("signature verification failed: {0}")]
    Invalid(String),
    /// Verifier could not run
    #[error("cannot run CMS verification: {0}")]
    Io(#[from] io::Error),
}

/// Verifies a PEM armored CMS document and returns its content
#[async_trait]
pub trait CmsBackend: Send + Sync + 'static {
    /// Verify `pem` against the given certificate files
    async fn verify(
        &self,
        pem: &str,
        signing_cert: &Path,
        ca_cert: &Path,
    ) -> std::result::Result<Vec<u8>, CmsError>;
}

/// Runs `openssl cms -verify`
pub struct OpensslCms {
    binary: String,
}

impl OpensslCms {
    /// Verifier using the given `openssl` executable
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CmsBackend for OpensslCms {
    async fn verify(
        &self,
        pem: &str,
        signing_cert: &Path,
        ca_cert: &Path,
    ) -> std::result::Result<Vec<u8>, CmsError> {
        if !signing_cert.exists() || !ca_cert.exists() {
            return Err(CmsError::MissingCertificates);
        }

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("cms")
            .arg("-verify")
            .arg("-certfile")
            .arg(signing_cert)
            .arg("-CAfile")
            .arg(ca_cert)
            .args(["-inform", "PEM", "-nosmimecap", "-nocerts", "-noattr"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("openssl stdin unavailable"))?;
        let input = pem.as_bytes().to_vec();
        let feed = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file or directory") {
            return Err(CmsError::MissingCertificates);
        }
        // A broken pipe on stdin only matters if openssl also failed
        if let Err(e) = fed {
            debug!(error = %e, "openssl closed stdin early");
        }
        let reason = stderr
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("openssl exited with an error")
            .to_string();
        Err(CmsError::Invalid(reason))
    }
}

/// Owner-only directory with certificates and the revocation list
#[derive(Debug, Clone)]
pub struct SigningDir {
    path: PathBuf,
}

impl SigningDir {
    /// Open `path`, creating it (mode 0700) if absent.
    ///
    /// Existing directories readable or writable by group or others are
    /// used, but logged as a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            create_private_dir(&path)?;
            info!(path = %path.display(), "Created signing directory");
        } else if !path.is_dir() {
            return Err(Error::Config(format!(
                "signing_dir {} is not a directory",
                path.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)?.permissions().mode();
            if mode & 0o077 != 0 {
                warn!(
                    path = %path.display(),
                    mode = format!("{:o}", mode & 0o777),
                    "Signing directory is accessible by other users; restrict it to 0700"
                );
            }
        }

        Ok(Self { path })
    }

    /// Directory path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Signing certificate path
    #[must_use]
    pub fn signing_cert_path(&self) -> PathBuf {
        self.path.join(SIGNING_CERT_FILE)
    }

    /// CA certificate path
    #[must_use]
    pub fn ca_cert_path(&self) -> PathBuf {
        self.path.join(CA_CERT_FILE)
    }

    /// Persisted revocation list path
    #[must_use]
    pub fn revoked_path(&self) -> PathBuf {
        self.path.join(REVOKED_FILE)
    }

    /// Replace `name` with `contents` (mode 0600) via a temporary sibling
    pub async fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<()> {
        let target = self.path.join(name);
        let tmp = self
            .path
            .join(format!(".{name}.{}.tmp", std::process::id()));
        tokio::fs::write(&tmp, contents).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read `name` with its modification time, `None` if absent
    pub async fn read_with_mtime(&self, name: &str) -> Result<Option<(Vec<u8>, SystemTime)>> {
        let target = self.path.join(name);
        let contents = match tokio::fs::read(&target).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mtime = tokio::fs::metadata(&target).await?.modified()?;
        Ok(Some((contents, mtime)))
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(|e| {
        Error::Config(format!(
            "Cannot create signing_dir {}: {e}",
            path.display()
        ))
    })
}

/// Reject anything that is not a PEM encoded X.509 certificate
fn check_certificate(kind: &str, pem: &str) -> Result<()> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::service(format!("{kind} certificate is not PEM: {e}")))?;
    let cert = parsed
        .parse_x509()
        .map_err(|e| Error::service(format!("{kind} certificate is not X.509: {e}")))?;
    debug!(kind, subject = %cert.subject(), "Fetched certificate");
    Ok(())
}

/// Verifies signed documents, fetching certificates once when missing
pub struct SignedDocumentVerifier {
    cms: Arc<dyn CmsBackend>,
    dir: SigningDir,
    api: Arc<dyn IdentityApi>,
    versions: Arc<VersionSelector>,
    admin: Arc<AdminTokenManager>,
    fetch_lock: Mutex<()>,
}

impl SignedDocumentVerifier {
    /// Verifier over `dir`, fetching certificates through `api`
    #[must_use]
    pub fn new(
        cms: Arc<dyn CmsBackend>,
        dir: SigningDir,
        api: Arc<dyn IdentityApi>,
        versions: Arc<VersionSelector>,
        admin: Arc<AdminTokenManager>,
    ) -> Self {
        Self {
            cms,
            dir,
            api,
            versions,
            admin,
            fetch_lock: Mutex::new(()),
        }
    }

    /// Signing directory in use
    #[must_use]
    pub fn signing_dir(&self) -> &SigningDir {
        &self.dir
    }

    /// Verify a PEM document and return its signed content.
    ///
    /// A bad signature is [`Error::InvalidToken`]; being unable to obtain
    /// certificates is a service error.
    pub async fn verify(&self, pem: &str) -> Result<Vec<u8>> {
        match self.verify_once(pem).await {
            Err(CmsError::MissingCertificates) => {
                self.fetch_certificates().await?;
                match self.verify_once(pem).await {
                    Err(CmsError::MissingCertificates) => Err(Error::service(
                        "signing certificates still unavailable after fetching",
                    )),
                    other => other.map_err(cms_to_error),
                }
            }
            other => other.map_err(cms_to_error),
        }
    }

    async fn verify_once(&self, pem: &str) -> std::result::Result<Vec<u8>, CmsError> {
        self.cms
            .verify(pem, &self.dir.signing_cert_path(), &self.dir.ca_cert_path())
            .await
    }

    /// Download and persist the signing and CA certificates
    pub async fn fetch_certificates(&self) -> Result<()> {
        let _guard = self.fetch_lock.lock().await;
        let version = self.versions.version().await?;
        let api = &self.api;

        let signing = self
            .admin
            .with_admin_token(|token| async move { api.signing_certificate(version, &token).await })
            .await?;
        check_certificate("signing", &signing)?;

        let ca = self
            .admin
            .with_admin_token(|token| async move { api.ca_certificate(version, &token).await })
            .await?;
        check_certificate("CA", &ca)?;

        self.dir.write_atomic(CA_CERT_FILE, ca.as_bytes()).await?;
        self.dir
            .write_atomic(SIGNING_CERT_FILE, signing.as_bytes())
            .await?;
        info!(dir = %self.dir.path().display(), "Stored signing certificates");
        Ok(())
    }
}

fn cms_to_error(e: CmsError) -> Error {
    match e {
        CmsError::Invalid(reason) => Error::invalid_token(format!("signature check failed: {reason}")),
        other => Error::service(other.to_string()),
    }
}
