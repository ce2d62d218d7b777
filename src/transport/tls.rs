use super::{
    stream::{StreamConnection, StreamConnectionInner},
    SipAddr, SipConnection, TransportSender,
};
use crate::{Error, Result};
use rsip::SipMessage;
use std::sync::{Arc, Mutex};
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpStream,
};
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::info;

type TlsRead = ReadHalf<TlsStream<TcpStream>>;
type TlsWrite = WriteHalf<TlsStream<TcpStream>>;

pub struct TlsInner {
    pub stream: StreamConnectionInner<TlsRead, TlsWrite>,
    refs: Mutex<usize>,
}

/// An outbound TLS connection.
///
/// Certificate policy stays with the caller: either the webpki default
/// roots via [`connect`](TlsConnection::connect) or a prepared
/// [`ClientConfig`] via [`connect_with_config`](TlsConnection::connect_with_config).
#[derive(Clone)]
pub struct TlsConnection {
    inner: Arc<TlsInner>,
}

impl TlsConnection {
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::connect_with_config(remote, Arc::new(config)).await
    }

    pub async fn connect_with_config(remote: &SipAddr, config: Arc<ClientConfig>) -> Result<Self> {
        let connector = TlsConnector::from(config);
        let sockaddr = remote.get_socketaddr()?;
        let tcp = TcpStream::connect(sockaddr).await?;
        let local_addr = SipAddr::new(rsip::transport::Transport::Tls, tcp.local_addr()?.into());

        let server_name = ServerName::try_from(remote.addr.host.to_string())
            .map_err(|e| Error::TransportLayerError(e.to_string(), remote.clone()))?
            .to_owned();
        let stream = connector.connect(server_name, tcp).await?;
        info!("tls connected {} -> {}", local_addr, remote);

        let (read_half, write_half) = tokio::io::split(stream);
        let remote_addr = SipAddr::new(rsip::transport::Transport::Tls, remote.addr.clone());
        Ok(TlsConnection {
            inner: Arc::new(TlsInner {
                stream: StreamConnectionInner::new(local_addr, remote_addr, read_half, write_half),
                refs: Mutex::new(1),
            }),
        })
    }

    /// Certificates from a PEM bundle, for building custom root stores.
    pub fn load_certificates(
        pem: &[u8],
    ) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.stream.remote_addr
    }

    pub fn local_addr(&self) -> &SipAddr {
        &self.inner.stream.local_addr
    }

    pub fn add_ref(&self) {
        *self.inner.refs.lock().unwrap() += 1;
    }

    pub fn try_close(&self) -> usize {
        let mut refs = self.inner.refs.lock().unwrap();
        *refs = refs.saturating_sub(1);
        let remaining = *refs;
        drop(refs);
        if remaining == 0 {
            let connection = self.clone();
            tokio::spawn(async move {
                connection.inner.stream.close().await.ok();
            });
        }
        remaining
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.stream.send_message(msg).await
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner
            .stream
            .serve_loop(sender, SipConnection::Tls(self.clone()))
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.stream.close().await
    }
}

#[async_trait::async_trait]
impl StreamConnection for TlsConnection {
    fn get_addr(&self) -> &SipAddr {
        TlsConnection::get_addr(self)
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        TlsConnection::send_message(self, msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.stream.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        TlsConnection::serve_loop(self, sender).await
    }

    async fn close(&self) -> Result<()> {
        TlsConnection::close(self).await
    }
}
