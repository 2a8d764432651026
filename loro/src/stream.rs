// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{
    Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerName,
};
use tokio_rustls::TlsConnector;

use crate::connect_options::{ConnectOptions, HttpProxy, Proxy};
use crate::error::{Error, ErrorKind};

/// The byte stream between client and server.
///
/// The core treats this as an unframed bidirectional pipe: reads may
/// return arbitrary chunks, writes are retried until complete, no
/// reordering or duplication occurs. Further transports plug in as new
/// variants without touching anything above this module.
pub enum Stream {
    /// Plain TCP stream.
    Mqtt(TcpStream),

    /// TLS over TCP.
    Mqtts(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Mqtt(..) => write!(f, "Stream::Mqtt"),
            Self::Mqtts(..) => write!(f, "Stream::Mqtts"),
        }
    }
}

/// Certificate verifier which accepts anything, for tests against servers
/// with self signed certificates.
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

impl Stream {
    /// Open a transport to the server in `options`, within the configured
    /// connect timeout.
    ///
    /// # Errors
    ///
    /// Returns error if resolution, the TCP connect, or the TLS handshake
    /// fails or times out.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, Error> {
        let connect = Self::connect_inner(options);
        timeout(options.connect_timeout(), connect)
            .await
            .map_err(|_elapsed| {
                Error::from_string(
                    ErrorKind::Unreachable,
                    format!("Timed out connecting to {}:{}", options.host(), options.port()),
                )
            })?
    }

    async fn connect_inner(options: &ConnectOptions) -> Result<Self, Error> {
        let tcp_stream = match options.proxy() {
            Proxy::None => {
                let addr = Self::resolve(options).await?;
                log::info!("Connecting to {addr}");
                TcpStream::connect(addr).await?
            }
            Proxy::Http(proxy) => Self::connect_via_proxy(options, proxy).await?,
        };
        tcp_stream.set_nodelay(true)?;

        if !options.use_tls() {
            return Ok(Self::Mqtt(tcp_stream));
        }

        let config = Self::tls_config(options)?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(options.host()).map_err(|err| {
            Error::from_string(
                ErrorKind::TlsError,
                format!("Invalid server name {}: {err}", options.host()),
            )
        })?;
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|err| {
                Error::from_string(ErrorKind::TlsError, format!("TLS handshake failed: {err}"))
            })?;
        Ok(Self::Mqtts(Box::new(tls_stream)))
    }

    /// Tunnel through an HTTP proxy with a CONNECT request.
    async fn connect_via_proxy(
        options: &ConnectOptions,
        proxy: &HttpProxy,
    ) -> Result<TcpStream, Error> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        log::info!(
            "Connecting to {}:{} via proxy {}:{}",
            options.host(),
            options.port(),
            proxy.hostname,
            proxy.port
        );
        let mut stream =
            TcpStream::connect((proxy.hostname.as_str(), proxy.port)).await?;

        let target = format!("{}:{}", options.host(), options.port());
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            let credentials = base64::encode(format!("{username}:{password}"));
            request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        // Read the status line and headers of the proxy answer.
        let mut response = Vec::with_capacity(256);
        let mut byte = [0_u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() > 4096 {
                return Err(Error::new(
                    ErrorKind::ProxyError,
                    "Oversized proxy response",
                ));
            }
            let n_read = stream.read(&mut byte).await?;
            if n_read == 0 {
                return Err(Error::new(
                    ErrorKind::ProxyError,
                    "Proxy closed the connection during CONNECT",
                ));
            }
            response.push(byte[0]);
        }

        let status_line = response
            .split(|b| *b == b'\r')
            .next()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        if !status_line.contains(" 200") {
            return Err(Error::from_string(
                ErrorKind::ProxyError,
                format!("Proxy refused CONNECT: {status_line}"),
            ));
        }
        Ok(stream)
    }

    /// Resolve the server address, honouring the IPv6 preference.
    async fn resolve(options: &ConnectOptions) -> Result<SocketAddr, Error> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((options.host(), options.port()))
                .await?
                .collect();
        let preferred = addrs
            .iter()
            .find(|addr| addr.is_ipv6() == options.prefer_ipv6())
            .or_else(|| addrs.first());
        preferred.copied().ok_or_else(|| {
            Error::from_string(
                ErrorKind::Unreachable,
                format!("No address found for {}", options.host()),
            )
        })
    }

    fn tls_config(options: &ConnectOptions) -> Result<ClientConfig, Error> {
        let tls = options.tls_options();
        let builder = ClientConfig::builder().with_safe_defaults();

        if tls.allow_invalid_certificates {
            return Ok(builder
                .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
                .with_no_client_auth());
        }

        let mut root_store = RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                anchor.subject,
                anchor.spki,
                anchor.name_constraints,
            )
        }));
        if let Some(ca_file) = &tls.root_ca_file {
            for cert in Self::load_certificates(ca_file)? {
                root_store.add(&cert).map_err(|err| {
                    Error::from_string(
                        ErrorKind::TlsError,
                        format!("Invalid CA certificate in {}: {err}", ca_file.display()),
                    )
                })?;
            }
        }
        let builder = builder.with_root_certificates(root_store);

        match (&tls.client_cert_file, &tls.client_key_file) {
            (Some(cert_file), Some(key_file)) => {
                let certs = Self::load_certificates(cert_file)?;
                let key = Self::load_private_key(key_file)?;
                builder.with_client_auth_cert(certs, key).map_err(|err| {
                    Error::from_string(
                        ErrorKind::TlsError,
                        format!("Invalid client certificate: {err}"),
                    )
                })
            }
            (None, None) => Ok(builder.with_no_client_auth()),
            _ => Err(Error::new(
                ErrorKind::ConfigError,
                "Client certificate and key files must be set together",
            )),
        }
    }

    fn load_certificates(path: &Path) -> Result<Vec<Certificate>, Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)?;
        if certs.is_empty() {
            return Err(Error::from_string(
                ErrorKind::TlsError,
                format!("No certificate found in {}", path.display()),
            ));
        }
        Ok(certs.into_iter().map(Certificate).collect())
    }

    fn load_private_key(path: &Path) -> Result<PrivateKey, Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        loop {
            match rustls_pemfile::read_one(&mut reader)? {
                Some(rustls_pemfile::Item::PKCS8Key(key) | rustls_pemfile::Item::RSAKey(key)) => {
                    return Ok(PrivateKey(key));
                }
                Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
                Some(_other) => continue,
                None => {
                    return Err(Error::from_string(
                        ErrorKind::TlsError,
                        format!("No private key found in {}", path.display()),
                    ));
                }
            }
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Mqtt(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Mqtts(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Mqtt(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Mqtts(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Mqtt(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Mqtts(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Mqtt(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Mqtts(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
