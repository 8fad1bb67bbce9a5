//! Byte-level transport: the socket with its optional TLS layer, and the
//! zlib stream compression codec (XEP-0138).

use std::io;
use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::error::{ConnectionError, ErrorCondition, XmppError};

/// Channel-binding material of the active TLS session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelBindings {
    /// RFC 9266 `tls-exporter`.
    pub exporter: Option<Vec<u8>>,
    /// RFC 5929 `tls-server-end-point`, always hashed with SHA-256.
    pub server_end_point: Option<Vec<u8>>,
}

/// Channel-binding types as named in SASL `-PLUS` negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelBindingType {
    TlsUnique,
    TlsExporter,
    TlsServerEndPoint,
}

impl ChannelBindingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelBindingType::TlsUnique => "tls-unique",
            ChannelBindingType::TlsExporter => "tls-exporter",
            ChannelBindingType::TlsServerEndPoint => "tls-server-end-point",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tls-unique" => Some(ChannelBindingType::TlsUnique),
            "tls-exporter" => Some(ChannelBindingType::TlsExporter),
            "tls-server-end-point" => Some(ChannelBindingType::TlsServerEndPoint),
            _ => None,
        }
    }
}

impl ChannelBindings {
    /// Binding data for `kind`; rustls does not expose `tls-unique`.
    pub fn get(&self, kind: ChannelBindingType) -> Result<Vec<u8>, XmppError> {
        let data = match kind {
            ChannelBindingType::TlsUnique => None,
            ChannelBindingType::TlsExporter => self.exporter.clone(),
            ChannelBindingType::TlsServerEndPoint => self.server_end_point.clone(),
        };
        data.ok_or_else(|| {
            XmppError::with_message(
                ErrorCondition::FeatureNotImplemented,
                format!("channel binding {} is not available", kind.as_str()),
            )
        })
    }
}

pub(crate) enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Closed,
}

impl Socket {
    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Socket::Tls(_))
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Plain(stream) => stream.read(buf).await,
            Socket::Tls(stream) => stream.read(buf).await,
            Socket::Closed => std::future::pending().await,
        }
    }

    pub(crate) async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Socket::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Socket::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Socket::Closed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is closed",
            )),
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        let result = match self {
            Socket::Plain(stream) => stream.shutdown().await,
            Socket::Tls(stream) => stream.shutdown().await,
            Socket::Closed => Ok(()),
        };
        if let Err(e) = result {
            debug!(error = %e, "Socket shutdown failed");
        }
        *self = Socket::Closed;
    }

    pub(crate) fn channel_bindings(&self) -> ChannelBindings {
        let Socket::Tls(stream) = self else {
            return ChannelBindings::default();
        };
        let (_, connection) = stream.get_ref();
        let exporter = connection
            .export_keying_material([0u8; 32], b"EXPORTER-Channel-Binding", None)
            .map(|material| material.to_vec())
            .map_err(|e| warn!(error = %e, "tls-exporter unavailable"))
            .ok();
        let server_end_point = connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| Sha256::digest(cert.as_ref()).to_vec());
        ChannelBindings {
            exporter,
            server_end_point,
        }
    }
}

/// Client TLS configuration backed by the platform trust store.
pub(crate) fn default_tls_config() -> Result<Arc<ClientConfig>, ConnectionError> {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for error in &native_certs.errors {
        warn!(error = %error, "Failed to load a system root certificate");
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!(error = %e, "Skipping unusable root certificate");
        }
    }
    if root_store.is_empty() {
        return Err(ConnectionError::TlsHandshakeFailed(
            "no system root certificates found".to_string(),
        ));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Wrap an established TCP stream in TLS, using `domain` for SNI and
/// certificate verification.
pub(crate) async fn upgrade(
    stream: TcpStream,
    config: Arc<ClientConfig>,
    domain: &str,
) -> Result<TlsStream<TcpStream>, ConnectionError> {
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ConnectionError::TlsHandshakeFailed(format!("invalid server name: {e}")))?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(classify_tls_error)
}

fn classify_tls_error(error: io::Error) -> ConnectionError {
    let certificate = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(_)));
    if certificate {
        ConnectionError::TlsCertificate(error.to_string())
    } else {
        ConnectionError::TlsHandshakeFailed(error.to_string())
    }
}

/// zlib codec with a sync flush after every write.
pub struct ZlibCodec {
    compress: Compress,
    decompress: Decompress,
}

impl ZlibCodec {
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::default(), true),
            decompress: Decompress::new(true),
        }
    }

    pub fn compress(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut consumed = 0;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(64));
            }
            let before = self.compress.total_in();
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(io::Error::other)?;
            consumed += (self.compress.total_in() - before) as usize;
            // the flush is complete once output stops filling the buffer
            if consumed >= data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }

    pub fn decompress(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 4 + 64);
        let mut consumed = 0;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(64));
            }
            let before = self.decompress.total_in();
            self.decompress
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            consumed += (self.decompress.total_in() - before) as usize;
            if consumed >= data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

impl Default for ZlibCodec {
    fn default() -> Self {
        Self::new()
    }
}
