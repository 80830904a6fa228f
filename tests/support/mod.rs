// Helper functions are shared across multiple test crates; not every helper is
// referenced in each test module.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use devstack_secrets::certs::BundlePaths;
use devstack_secrets::config::Settings;
use rcgen::{CertificateParams, DnType, Issuer, KeyPair, PublicKeyData, SignatureAlgorithm};
use serde_json::{Value, json};
use time::OffsetDateTime;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

pub(crate) const ROOT_TOKEN: &str = "hvs.devstack-root-token-0001";
pub(crate) const SERVICE_TOKEN: &str = "hvs.devstack-postgres-token-01";

/// Settings pointing at `server` with a fast retry budget and the given
/// key directory.
pub(crate) fn test_settings(server: &MockServer, keys_dir: &Path) -> Settings {
    let mut settings =
        Settings::new(Some(keys_dir.join("absent.toml"))).expect("default settings");
    settings.vault_addr = server.uri();
    settings.keys_dir = keys_dir.to_path_buf();
    settings.retry.attempts = 3;
    settings.retry.delay_ms = 10;
    settings.request_timeout_secs = 2;
    settings
}

pub(crate) async fn stub_health(server: &MockServer, status: u16) {
    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

pub(crate) async fn stub_kv_record(
    server: &MockServer,
    token: &str,
    mount: &str,
    service: &str,
    data: Value,
    version: u64,
) {
    Mock::given(method("GET"))
        .and(path(format!("/v1/{mount}/data/{service}")))
        .and(header("X-Vault-Token", token))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "data": data,
                "metadata": { "version": version }
            }
        })))
        .mount(server)
        .await;
}

pub(crate) async fn stub_kv_missing(server: &MockServer, token: &str, mount: &str, service: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/v1/{mount}/data/{service}")))
        .and(header("X-Vault-Token", token))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "errors": [] })))
        .mount(server)
        .await;
}

pub(crate) fn postgres_record(tls_enabled: bool) -> Value {
    json!({
        "user": "devuser",
        "password": "p4ssw0rd-from-the-kv-store-000000000000000",
        "database": "dev_database",
        "email": null,
        "tls_enabled": tls_enabled
    })
}

pub(crate) fn cert_pem(name: &str, valid_for: Duration) -> String {
    cert_and_key_pem(name, valid_for).0
}

/// Self-signed certificate and its private key, both PEM.
pub(crate) fn cert_and_key_pem(name: &str, valid_for: Duration) -> (String, String) {
    let mut params = CertificateParams::new(vec![name.to_string()]).expect("params");
    params.distinguished_name.push(DnType::CommonName, name);
    params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after =
        OffsetDateTime::now_utc() + time::Duration::try_from(valid_for).expect("duration fits");
    let key = KeyPair::generate().expect("key");
    let cert = params.self_signed(&key).expect("self signed").pem();
    (cert, key.serialize_pem())
}

/// Public key lifted out of a CSR; keys from `KeyPair::generate` are P-256.
struct CsrPublicKey(Vec<u8>);

impl PublicKeyData for CsrPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.0
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

/// Issues a leaf for the key inside `csr_pem`, signed by a throwaway CA.
pub(crate) fn sign_csr_pem(csr_pem: &str, name: &str, valid_for: Duration) -> String {
    let pem = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes())
        .expect("csr pem")
        .1;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents).expect("csr der");
    let public_key = CsrPublicKey(
        csr.certification_request_info
            .subject_pki
            .subject_public_key
            .data
            .to_vec(),
    );

    let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "devstack test CA");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let issuer = Issuer::new(ca_params, KeyPair::generate().expect("ca key"));

    let mut params = CertificateParams::new(vec![name.to_string()]).expect("leaf params");
    params.distinguished_name.push(DnType::CommonName, name);
    params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after =
        OffsetDateTime::now_utc() + time::Duration::try_from(valid_for).expect("duration fits");
    params
        .signed_by(&public_key, &issuer)
        .expect("sign leaf")
        .pem()
}

/// Answers a PKI sign request the way the backend does: the returned
/// certificate carries the public key of the submitted CSR.
pub(crate) struct SignCsr {
    pub(crate) valid_for: Duration,
}

impl Respond for SignCsr {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = request.body_json().expect("sign request body");
        let csr = body["csr"].as_str().expect("csr field");
        let name = body["common_name"].as_str().unwrap_or("leaf");
        ResponseTemplate::new(200).set_body_json(json!({ "data": {
            "certificate": sign_csr_pem(csr, name, self.valid_for),
            "issuing_ca": "INT"
        } }))
    }
}

/// Writes cert, key and CA into `dir` with `mode`.
pub(crate) fn write_bundle(dir: &Path, name: &str, mode: u32) -> BundlePaths {
    fs::create_dir_all(dir).expect("create bundle dir");
    let paths = BundlePaths::in_dir(dir);
    let (cert, key) = cert_and_key_pem(name, Duration::from_secs(365 * 86_400));
    for (file, contents) in [
        (&paths.cert, cert.as_str()),
        (&paths.key, key.as_str()),
        (
            &paths.ca,
            "-----BEGIN CERTIFICATE-----\nca\n-----END CERTIFICATE-----\n",
        ),
    ] {
        fs::write(file, contents).expect("write bundle file");
        fs::set_permissions(file, fs::Permissions::from_mode(mode)).expect("chmod");
    }
    paths
}

pub(crate) fn write_keys(keys_dir: &Path, shares: &[&str], threshold: u32) {
    fs::create_dir_all(keys_dir).expect("create keys dir");
    let payload = json!({
        "unseal_keys_b64": shares,
        "unseal_keys_hex": [],
        "unseal_shares": shares.len(),
        "unseal_threshold": threshold,
        "root_token": ROOT_TOKEN
    });
    let path = keys_dir.join("keys.json");
    fs::write(&path, serde_json::to_vec(&payload).expect("json")).expect("write keys");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod keys");
}

pub(crate) fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).expect("metadata").permissions().mode() & 0o777
}
