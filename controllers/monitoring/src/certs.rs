//! Webhook serving certificate.
//!
//! A self-signed CA and a leaf certificate for the webhook Service are written
//! to the certificate directory at startup. Existing material is reused until
//! it enters the renewal window; renewal rewrites the files atomically.
//!
//! The API server trusts the webhook through the `caBundle` of its
//! ValidatingWebhookConfiguration, which [`publish_ca_bundle`] keeps current.

use crate::cluster::ClusterClient;
use crate::error::ControllerError;
use k8s_openapi::ByteString;
use openssl::asn1::Asn1Time;
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslMethod};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509};
use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CA_CERT_FILE: &str = "ca.crt";
pub const TLS_CERT_FILE: &str = "tls.crt";
pub const TLS_KEY_FILE: &str = "tls.key";

/// Permission bits of the private key.
const KEY_MODE: u32 = 0o600;
const CERT_MODE: u32 = 0o644;

/// Lifetime of a freshly issued CA and leaf.
pub const VALIDITY_DAYS: u32 = 365;

/// Material expiring within this many days is replaced.
pub const RENEW_BEFORE_DAYS: u32 = 30;

/// How often the renewal task checks expiry.
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Delay before the next check after a failed one.
pub const RENEWAL_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// PEM encoded CA and leaf pair.
#[derive(Clone)]
pub struct WebhookCertificate {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for WebhookCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookCertificate")
            .field("ca_pem_len", &self.ca_pem.len())
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl WebhookCertificate {
    /// Whether the leaf expires within `days` from now.
    pub fn expires_within(&self, days: u32) -> Result<bool, ControllerError> {
        let cert = X509::from_pem(&self.cert_pem)?;
        let horizon = Asn1Time::days_from_now(days)?;
        Ok(cert.not_after().compare(&horizon)? != Ordering::Greater)
    }

    /// Server-side TLS acceptor presenting the leaf.
    pub fn acceptor(&self) -> Result<SslAcceptor, ControllerError> {
        let cert = X509::from_pem(&self.cert_pem)?;
        let key = PKey::private_key_from_pem(&self.key_pem)?;
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        builder.set_private_key(&key)?;
        builder.set_certificate(&cert)?;
        builder.check_private_key()?;
        Ok(builder.build())
    }
}

/// Provisions and renews the webhook certificate in a directory.
#[derive(Debug, Clone)]
pub struct CertificateManager {
    dir: PathBuf,
    service: String,
    namespace: String,
    cluster_domain: String,
}

impl CertificateManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        service: impl Into<String>,
        namespace: impl Into<String>,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            service: service.into(),
            namespace: namespace.into(),
            cluster_domain: cluster_domain.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names the API server may use to reach the webhook Service.
    pub fn dns_names(&self) -> Vec<String> {
        let svc = &self.service;
        let ns = &self.namespace;
        vec![
            svc.clone(),
            format!("{svc}.{ns}"),
            format!("{svc}.{ns}.svc"),
            format!("{svc}.{ns}.svc.{}", self.cluster_domain),
        ]
    }

    /// Returns usable material, reusing what is on disk when it is still valid.
    pub fn ensure(&self) -> Result<WebhookCertificate, ControllerError> {
        match self.load() {
            Ok(Some(existing)) => match existing.expires_within(RENEW_BEFORE_DAYS) {
                Ok(false) => {
                    info!("Reusing webhook certificate in {}", self.dir.display());
                    return Ok(existing);
                }
                Ok(true) => info!("Webhook certificate in {} is due for renewal", self.dir.display()),
                Err(e) => warn!("Existing webhook certificate unreadable, replacing: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("Existing webhook certificate unusable, replacing: {}", e),
        }
        self.provision()
    }

    /// Re-provisions when the files are missing or inside the renewal window.
    pub fn renew_if_due(&self) -> Result<Option<WebhookCertificate>, ControllerError> {
        if let Some(existing) = self.load()? {
            if !existing.expires_within(RENEW_BEFORE_DAYS)? {
                return Ok(None);
            }
        }
        self.provision().map(Some)
    }

    /// The CA certificate on disk, whether or not the leaf is still usable.
    pub fn current_ca(&self) -> Result<Option<Vec<u8>>, ControllerError> {
        let path = self.dir.join(CA_CERT_FILE);
        match fs::read(&path) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ControllerError::io(&path, e)),
        }
    }

    /// Reads the files if all three exist and the key matches the leaf.
    pub fn load(&self) -> Result<Option<WebhookCertificate>, ControllerError> {
        let paths = [CA_CERT_FILE, TLS_CERT_FILE, TLS_KEY_FILE].map(|f| self.dir.join(f));
        if !paths.iter().all(|p| p.is_file()) {
            return Ok(None);
        }
        let read = |p: &Path| fs::read(p).map_err(|e| ControllerError::io(p, e));
        let material = WebhookCertificate {
            ca_pem: read(&paths[0])?,
            cert_pem: read(&paths[1])?,
            key_pem: read(&paths[2])?,
        };

        let cert = X509::from_pem(&material.cert_pem)?;
        let key = PKey::private_key_from_pem(&material.key_pem)?;
        if !cert.public_key()?.public_eq(&key) {
            return Ok(None);
        }
        Ok(Some(material))
    }

    /// Issues a new CA and leaf and writes them atomically.
    pub fn provision(&self) -> Result<WebhookCertificate, ControllerError> {
        let ca_key = gen_ecc_key()?;
        let ca_cert = gen_ca_cert(&format!("{}-ca", self.service), &ca_key)?;
        let leaf_key = gen_ecc_key()?;
        let leaf_cert = gen_leaf_cert(&self.dns_names(), &leaf_key, &ca_cert, &ca_key)?;

        let material = WebhookCertificate {
            ca_pem: ca_cert.to_pem()?,
            cert_pem: leaf_cert.to_pem()?,
            key_pem: leaf_key.private_key_to_pem_pkcs8()?,
        };

        fs::create_dir_all(&self.dir).map_err(|e| ControllerError::io(&self.dir, e))?;
        atomic_write(&self.dir.join(CA_CERT_FILE), &material.ca_pem, CERT_MODE)?;
        atomic_write(&self.dir.join(TLS_KEY_FILE), &material.key_pem, KEY_MODE)?;
        atomic_write(&self.dir.join(TLS_CERT_FILE), &material.cert_pem, CERT_MODE)?;

        info!(
            "Provisioned webhook certificate for {} in {}",
            self.dns_names().join(", "),
            self.dir.display()
        );
        Ok(material)
    }
}

/// Result of [`publish_ca_bundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaBundle {
    /// No webhook configuration with that name exists yet.
    Missing,
    /// Every webhook already carried the bundle.
    Current,
    Updated,
}

/// Sets `bundle` (PEM, one or more CAs) as the `caBundle` of every webhook in `config_name`.
pub async fn publish_ca_bundle(
    client: &dyn ClusterClient,
    config_name: &str,
    bundle: &[u8],
) -> Result<CaBundle, ControllerError> {
    let Some(mut config) = client.get_webhook_config(config_name).await? else {
        warn!(context = "webhook", "ValidatingWebhookConfiguration {} not found, CA bundle not published", config_name);
        return Ok(CaBundle::Missing);
    };

    let mut changed = false;
    for webhook in config.webhooks.iter_mut().flatten() {
        if webhook.client_config.ca_bundle.as_ref().map(|b| b.0.as_slice()) != Some(bundle) {
            webhook.client_config.ca_bundle = Some(ByteString(bundle.to_vec()));
            changed = true;
        }
    }
    if !changed {
        debug!(context = "webhook", "CA bundle of {} is current", config_name);
        return Ok(CaBundle::Current);
    }

    client.patch_webhook_config(&config).await?;
    info!(context = "webhook", "Published CA bundle to ValidatingWebhookConfiguration {}", config_name);
    Ok(CaBundle::Updated)
}

fn atomic_write(path: &Path, content: &[u8], mode: u32) -> Result<(), ControllerError> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let written = create_with_mode(&tmp, mode).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(ControllerError::io(&tmp, e));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(ControllerError::io(path, e));
    }
    Ok(())
}

/// Creates (or truncates) `path` with permission bits `mode`, whatever the umask.
#[cfg(unix)]
fn create_with_mode(path: &Path, mode: u32) -> std::io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    // `mode` only applies on creation; a leftover temp file keeps its old bits.
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    Ok(file)
}

#[cfg(not(unix))]
fn create_with_mode(path: &Path, _mode: u32) -> std::io::Result<fs::File> {
    fs::File::create(path)
}

fn gen_ecc_key() -> Result<PKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    PKey::from_ec_key(EcKey::generate(&group)?)
}

fn subject(common_name: &str) -> Result<X509Name, ErrorStack> {
    let mut name = X509Name::builder()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn gen_ca_cert(common_name: &str, key: &PKey<Private>) -> Result<X509, ErrorStack> {
    let name = subject(common_name)?;
    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(VALIDITY_DAYS)?.as_ref())?;
    builder.append_extension(SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn gen_leaf_cert(
    dns_names: &[String],
    key: &PKey<Private>,
    ca_cert: &X509,
    ca_key: &PKey<Private>,
) -> Result<X509, ErrorStack> {
    let common_name = dns_names.first().map(String::as_str).unwrap_or("webhook");
    let name = subject(common_name)?;
    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(ca_cert.subject_name())?;
    builder.set_pubkey(key)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(VALIDITY_DAYS)?.as_ref())?;
    builder.append_extension(SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?)?;
    builder.append_extension(
        AuthorityKeyIdentifier::new()
            .keyid(true)
            .issuer(true)
            .build(&builder.x509v3_context(Some(ca_cert), None))?,
    )?;
    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

    let mut san = SubjectAlternativeName::new();
    for name in dns_names {
        san.dns(name);
    }
    builder.append_extension(san.build(&builder.x509v3_context(Some(ca_cert), None))?)?;

    builder.sign(ca_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{webhook_config, MockClusterClient};
    use openssl::stack::Stack;
    use openssl::x509::store::X509StoreBuilder;
    use openssl::x509::X509StoreContext;

    fn manager(dir: &Path) -> CertificateManager {
        CertificateManager::new(dir, "monitoring-operator-webhook", "monitoring", "cluster.local")
    }

    #[test]
    fn test_dns_names() {
        let names = manager(Path::new("/unused")).dns_names();
        assert_eq!(
            names,
            vec![
                "monitoring-operator-webhook",
                "monitoring-operator-webhook.monitoring",
                "monitoring-operator-webhook.monitoring.svc",
                "monitoring-operator-webhook.monitoring.svc.cluster.local",
            ]
        );
    }

    #[test]
    fn test_provision_writes_verifiable_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        let material = mgr.provision().expect("provision");

        for file in [CA_CERT_FILE, TLS_CERT_FILE, TLS_KEY_FILE] {
            assert!(dir.path().join(file).is_file(), "{file} missing");
            assert!(!dir.path().join(format!("{file}.tmp")).exists());
        }

        let ca = X509::from_pem(&material.ca_pem).expect("ca");
        let leaf = X509::from_pem(&material.cert_pem).expect("leaf");
        let mut store = X509StoreBuilder::new().expect("store");
        store.add_cert(ca).expect("add ca");
        let store = store.build();
        let chain = Stack::new().expect("stack");
        let mut ctx = X509StoreContext::new().expect("ctx");
        let verified = ctx
            .init(&store, &leaf, &chain, |c| c.verify_cert())
            .expect("verify");
        assert!(verified);

        let sans: Vec<String> = leaf
            .subject_alt_names()
            .expect("san")
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(sans, mgr.dns_names());
        assert!(!material.expires_within(RENEW_BEFORE_DAYS).expect("expiry"));
        assert!(material.acceptor().is_ok());
    }

    #[test]
    fn test_ensure_reuses_valid_material() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        let first = mgr.ensure().expect("first");
        let second = mgr.ensure().expect("second");
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[test]
    fn test_ensure_replaces_mismatched_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        let first = mgr.provision().expect("first");
        let stray = gen_ecc_key().expect("key").private_key_to_pem_pkcs8().expect("pem");
        fs::write(dir.path().join(TLS_KEY_FILE), stray).expect("overwrite key");

        let second = mgr.ensure().expect("second");
        assert_ne!(first.cert_pem, second.cert_pem);
    }

    #[test]
    fn test_renewal_only_when_due() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        mgr.provision().expect("provision");
        assert!(mgr.renew_if_due().expect("check").is_none());

        fs::remove_file(dir.path().join(TLS_CERT_FILE)).expect("remove");
        assert!(mgr.renew_if_due().expect("renew").is_some());
        assert!(dir.path().join(TLS_CERT_FILE).is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_not_readable_by_others() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        // A stale temp file with open permissions must not leak its mode into the key.
        fs::write(dir.path().join(format!("{TLS_KEY_FILE}.tmp")), b"stale").expect("stale tmp");
        fs::set_permissions(
            dir.path().join(format!("{TLS_KEY_FILE}.tmp")),
            fs::Permissions::from_mode(0o666),
        )
        .expect("chmod");

        mgr.provision().expect("provision");
        let mode = |file: &str| {
            fs::metadata(dir.path().join(file))
                .expect("metadata")
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode(TLS_KEY_FILE), 0o600);
        assert_eq!(mode(TLS_CERT_FILE), 0o644);
        assert_eq!(mode(CA_CERT_FILE), 0o644);
    }

    #[tokio::test]
    async fn test_publish_ca_bundle() {
        let client = MockClusterClient::new();
        let bundle = b"-----BEGIN CERTIFICATE-----\nca\n-----END CERTIFICATE-----\n";
        assert_eq!(
            publish_ca_bundle(&client, "monitoring-operator-webhook", bundle).await.expect("publish"),
            CaBundle::Missing
        );

        client.put_webhook_config(webhook_config("monitoring-operator-webhook", 2));
        assert_eq!(
            publish_ca_bundle(&client, "monitoring-operator-webhook", bundle).await.expect("publish"),
            CaBundle::Updated
        );
        let config = client.webhook_config("monitoring-operator-webhook").expect("config");
        for webhook in config.webhooks.expect("webhooks") {
            assert_eq!(webhook.client_config.ca_bundle, Some(ByteString(bundle.to_vec())));
            assert!(webhook.client_config.url.is_some());
        }

        assert_eq!(
            publish_ca_bundle(&client, "monitoring-operator-webhook", bundle).await.expect("publish"),
            CaBundle::Current
        );
        assert_eq!(client.webhook_patches(), 1);
    }

    #[test]
    fn test_unwritable_directory_fails() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        // A regular file cannot act as the certificate directory.
        let mgr = manager(&file.path().join("certs"));
        assert!(mgr.ensure().is_err());
    }
}
