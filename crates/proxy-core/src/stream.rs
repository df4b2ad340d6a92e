//! Client stream with transparent TLS sniffing.
//!
//! The listener peeks the first byte of every accepted connection:
//! 0x16 (a TLS handshake record) routes through the rustls acceptor,
//! anything else is served as plaintext. One port serves both.

use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::error::ProxyError;

pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Sniff the first byte and wrap accordingly. Without an acceptor the
/// stream is always plaintext.
pub async fn sniff(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> std::io::Result<ClientStream> {
    let Some(acceptor) = acceptor else {
        return Ok(ClientStream::Plain(stream));
    };

    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 1 && first[0] == TLS_HANDSHAKE_RECORD {
        let tls = acceptor.accept(stream).await?;
        Ok(ClientStream::Tls(Box::new(tls)))
    } else {
        Ok(ClientStream::Plain(stream))
    }
}

/// Load a rustls server config from PEM cert and key files.
pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, ProxyError> {
    let certs = {
        let file = std::fs::File::open(cert_path).map_err(|e| {
            ProxyError::Protocol(format!("cannot open cert {}: {}", cert_path, e))
        })?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Protocol(format!("bad cert pem: {}", e)))?
    };
    let key = {
        let file = std::fs::File::open(key_path).map_err(|e| {
            ProxyError::Protocol(format!("cannot open key {}: {}", key_path, e))
        })?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| ProxyError::Protocol(format!("bad key pem: {}", e)))?
            .ok_or_else(|| ProxyError::Protocol("no private key in pem".into()))?
    };
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Protocol(format!("tls config: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
