//! HTTP(S) client used to query peer nodes.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use rustls::{ClientConfig, RootCertStore};

/// Shared connection pool to every peer.
///
/// Peers are trusted through `TLS_CA_PATH` when given, otherwise through the
/// bundled web PKI roots. Plain `http://` peers are allowed.
#[derive(Clone)]
pub struct PeerClient {
    inner: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl PeerClient {
    /// # Errors
    ///
    /// Returns an error if the CA bundle cannot be read or holds no
    /// certificates.
    pub fn new(ca_path: Option<&Path>) -> Result<Self> {
        let builder = hyper_rustls::HttpsConnectorBuilder::new();
        let builder = match ca_path {
            Some(path) => builder.with_tls_config(client_config(path)?),
            None => builder.with_webpki_roots(),
        };
        let connector = builder.https_or_http().enable_http1().build();
        Ok(Self {
            inner: Client::builder(TokioExecutor::new()).build(connector),
        })
    }

    /// `GET uri`, returning the status and the collected body.
    pub async fn get(&self, uri: Uri) -> Result<(StatusCode, Bytes)> {
        let req = Request::get(uri.clone())
            .header(hyper::header::ACCEPT, "application/json")
            .body(Empty::<Bytes>::new())
            .context("building peer request")?;
        let resp = self
            .inner
            .request(req)
            .await
            .with_context(|| format!("GET {uri}"))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .with_context(|| format!("reading body of {uri}"))?
            .to_bytes();
        Ok((status, body))
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient").finish_non_exhaustive()
    }
}

fn client_config(ca_path: &Path) -> Result<ClientConfig> {
    let file = File::open(ca_path)
        .with_context(|| format!("failed to open CA bundle: {}", ca_path.display()))?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.context("failed to parse CA certificate")?;
        roots
            .add(cert)
            .context("failed to add CA certificate to root store")?;
    }
    anyhow::ensure!(
        !roots.is_empty(),
        "no certificates found in {}",
        ca_path.display()
    );

    let provider = std::sync::Arc::new(rustls::crypto::ring::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("failed to configure TLS protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth())
}
