//! Byte-stream level I/O: dialling, TLS, and length-prefixed frame reads/writes.

use std::io;
use std::sync::Arc;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{ConnectErrorKind, DriverError, DriverResult, FrameError};
use crate::options::{ConnectOptions, ServerAddress, TlsOptions};
use crate::protocol::HEADER_LEN;

/// Any duplex stream a connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Open a TCP (and optionally TLS) stream to `address`.
pub async fn dial(address: &ServerAddress, options: &ConnectOptions) -> DriverResult<BoxedStream> {
    let connect = TcpStream::connect((address.host.as_str(), address.port));
    let stream = match tokio::time::timeout(options.connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(DriverError::connect(address, classify(&e), e)),
        Err(_) => {
            return Err(DriverError::connect(
                address,
                ConnectErrorKind::Timeout,
                format!("no connection within {:?}", options.connect_timeout),
            ))
        }
    };

    stream
        .set_nodelay(true)
        .map_err(|e| DriverError::connect(address, ConnectErrorKind::Io, e))?;

    match &options.tls {
        None => Ok(Box::new(stream)),
        Some(tls) => {
            let stream = tokio::time::timeout(
                options.connect_timeout,
                tls_connect(stream, address, tls),
            )
            .await
            .map_err(|_| {
                DriverError::connect(
                    address,
                    ConnectErrorKind::Timeout,
                    "TLS handshake did not finish in time",
                )
            })??;
            Ok(Box::new(stream))
        }
    }
}

fn classify(err: &io::Error) -> ConnectErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
        io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
        _ => ConnectErrorKind::Io,
    }
}

async fn tls_connect(
    stream: TcpStream,
    address: &ServerAddress,
    tls: &TlsOptions,
) -> DriverResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let tls_err = |msg: String| DriverError::connect(address, ConnectErrorKind::Tls, msg);

    let mut roots = RootCertStore::empty();
    if let Some(path) = &tls.ca_file {
        let pem = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| tls_err(format!("failed to read {}: {e}", path.display())))?;
        for der in pem_certificates(&pem).map_err(tls_err)? {
            roots
                .add(CertificateDer::from(der))
                .map_err(|e| tls_err(e.to_string()))?;
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let name = tls.server_name.clone().unwrap_or_else(|| address.host.clone());
    let server_name = ServerName::try_from(name).map_err(|e| tls_err(e.to_string()))?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| tls_err(e.to_string()))
}

/// Extract the DER bytes of every certificate in a PEM bundle.
fn pem_certificates(pem: &str) -> Result<Vec<Vec<u8>>, String> {
    let mut certs = Vec::new();
    let mut current: Option<String> = None;

    for line in pem.lines().map(str::trim) {
        if line.starts_with("-----BEGIN CERTIFICATE") {
            current = Some(String::new());
        } else if line.starts_with("-----END CERTIFICATE") {
            if let Some(encoded) = current.take() {
                let der = BASE64_STANDARD
                    .decode(encoded)
                    .map_err(|e| format!("invalid certificate encoding: {e}"))?;
                certs.push(der);
            }
        } else if let Some(buf) = current.as_mut() {
            buf.push_str(line);
        }
    }

    if certs.is_empty() {
        return Err("no certificates found in PEM file".to_string());
    }
    Ok(certs)
}

/// Read exactly one frame: the 4-byte length prefix, then the rest of the frame.
///
/// The returned buffer holds the whole frame, header included.
pub async fn receive_one_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: usize,
) -> DriverResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len < HEADER_LEN {
        return Err(FrameError::LengthMismatch {
            declared: len,
            actual: HEADER_LEN,
        }
        .into());
    }
    if len > max_message_size {
        return Err(FrameError::TooLarge {
            size: len,
            max: max_message_size,
        }
        .into());
    }

    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&len_buf);
    reader.read_exact(&mut frame[4..]).await?;
    Ok(frame)
}

/// Write a complete frame and flush it.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
