// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use codec::utils::random_client_id;
use codec::Will;

/// An opaque secret holding the CONNECT password.
///
/// The bytes are wiped when the value is dropped and never appear in
/// `Debug` output. The options struct owns the secret; the CONNECT encoder
/// reads it through [`Password::expose`] each time a connection is built,
/// since reconnecting requires the credential again.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Password(Vec<u8>);

impl Password {
    /// Wrap raw bytes as a password secret.
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Read the secret bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Password(***)")
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        for byte in &mut self.0 {
            // Best effort wipe; the compiler may not elide writes to
            // memory which is observable through the Vec.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
    }
}

/// An HTTP CONNECT proxy the transport tunnels through.
#[derive(Debug, Clone)]
pub struct HttpProxy {
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Proxy configuration of a connection.
#[derive(Debug, Clone, Default)]
pub enum Proxy {
    /// Direct connection.
    #[default]
    None,

    /// Tunnel through an HTTP CONNECT proxy.
    Http(HttpProxy),
}

/// TLS configuration of a connection.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip server certificate verification. Only for tests against
    /// servers with self signed certificates.
    pub allow_invalid_certificates: bool,

    /// Additional root CA file in PEM format.
    pub root_ca_file: Option<PathBuf>,

    /// Client certificate chain file in PEM format.
    pub client_cert_file: Option<PathBuf>,

    /// Client private key file in PEM format.
    pub client_key_file: Option<PathBuf>,
}

/// Options of the automatic reconnect behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Whether the client reconnects after a connection loss.
    pub enabled: bool,

    /// First retry delay; doubled after every failed attempt.
    pub base_delay: Duration,

    /// Upper bound of the retry delay.
    pub max_delay: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// All options of a client session.
///
/// Setter methods can be chained:
///
/// ```
/// use loro::ConnectOptions;
/// let mut options = ConnectOptions::new("localhost", 1883);
/// options.set_client_id("loro-demo").set_keep_alive(30);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    host: String,
    port: u16,
    prefer_ipv6: bool,
    proxy: Proxy,
    use_tls: bool,
    tls: TlsOptions,

    client_id: String,
    clean_start: bool,
    keep_alive: u16,
    session_expiry_interval: u32,
    receive_maximum: u16,
    maximum_packet_size: Option<u32>,
    topic_alias_maximum: u16,
    request_response_information: bool,
    request_problem_information: bool,
    user_properties: Vec<(String, String)>,
    will: Option<Will>,
    username: Option<String>,
    password: Option<Password>,
    authentication_method: Option<String>,
    authentication_data: Option<Vec<u8>>,

    connect_timeout: Duration,
    response_timeout: Duration,
    manual_ack: bool,
    reconnect: ReconnectOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            prefer_ipv6: false,
            proxy: Proxy::None,
            use_tls: false,
            tls: TlsOptions::default(),

            client_id: random_client_id("loro-"),
            clean_start: true,
            keep_alive: 60,
            session_expiry_interval: 0,
            receive_maximum: u16::MAX,
            maximum_packet_size: None,
            topic_alias_maximum: 0,
            request_response_information: false,
            request_problem_information: true,
            user_properties: Vec::new(),
            will: None,
            username: None,
            password: None,
            authentication_method: None,
            authentication_data: None,

            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            manual_ack: false,
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl ConnectOptions {
    /// Create options for a server at `host:port`.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Get server host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get server port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Prefer IPv6 addresses when the host name resolves to both families.
    pub fn set_prefer_ipv6(&mut self, prefer_ipv6: bool) -> &mut Self {
        self.prefer_ipv6 = prefer_ipv6;
        self
    }

    /// Get current IPv6 preference.
    #[must_use]
    pub const fn prefer_ipv6(&self) -> bool {
        self.prefer_ipv6
    }

    /// Update proxy configuration.
    pub fn set_proxy(&mut self, proxy: Proxy) -> &mut Self {
        self.proxy = proxy;
        self
    }

    /// Get a reference to proxy configuration.
    #[must_use]
    pub const fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Enable TLS for this connection.
    pub fn set_use_tls(&mut self, use_tls: bool) -> &mut Self {
        self.use_tls = use_tls;
        self
    }

    /// Get current TLS flag.
    #[must_use]
    pub const fn use_tls(&self) -> bool {
        self.use_tls
    }

    /// Update TLS options.
    pub fn set_tls_options(&mut self, tls: TlsOptions) -> &mut Self {
        self.tls = tls;
        self
    }

    /// Get a reference to TLS options.
    #[must_use]
    pub const fn tls_options(&self) -> &TlsOptions {
        &self.tls
    }

    /// Update client id.
    ///
    /// When never set, a random id of 23 characters is generated at
    /// construction time.
    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    /// Get current client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Update clean start flag.
    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    /// Get current clean start flag.
    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    /// Update keep alive, in seconds. Out of range values clamp to
    /// 0..=65535. Zero disables the keep alive mechanism.
    pub fn set_keep_alive(&mut self, keep_alive: u64) -> &mut Self {
        self.keep_alive = u16::try_from(keep_alive).unwrap_or(u16::MAX);
        self
    }

    /// Get current keep alive value in seconds.
    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Update session expiry interval, in seconds. Out of range values
    /// clamp to `u32::MAX`, which means the session never expires.
    pub fn set_session_expiry_interval(&mut self, interval: u64) -> &mut Self {
        self.session_expiry_interval = u32::try_from(interval).unwrap_or(u32::MAX);
        self
    }

    /// Get current session expiry interval.
    #[must_use]
    pub const fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval
    }

    /// Update receive maximum, the number of unacknowledged `QoS` 1/2
    /// publishes this client processes concurrently. Zero is treated as
    /// the protocol maximum of 65535.
    pub fn set_receive_maximum(&mut self, receive_maximum: u16) -> &mut Self {
        self.receive_maximum = if receive_maximum == 0 {
            u16::MAX
        } else {
            receive_maximum
        };
        self
    }

    /// Get current receive maximum.
    #[must_use]
    pub const fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    /// Update maximum packet size this client accepts from the server.
    /// Zero values are ignored, the protocol forbids them.
    pub fn set_maximum_packet_size(&mut self, maximum_packet_size: u32) -> &mut Self {
        if maximum_packet_size > 0 {
            self.maximum_packet_size = Some(maximum_packet_size);
        }
        self
    }

    /// Get current maximum packet size.
    #[must_use]
    pub const fn maximum_packet_size(&self) -> Option<u32> {
        self.maximum_packet_size
    }

    /// Update the highest topic alias value this client accepts in
    /// incoming publish packets. Zero disables inbound topic aliases.
    pub fn set_topic_alias_maximum(&mut self, topic_alias_maximum: u16) -> &mut Self {
        self.topic_alias_maximum = topic_alias_maximum;
        self
    }

    /// Get current topic alias maximum.
    #[must_use]
    pub const fn topic_alias_maximum(&self) -> u16 {
        self.topic_alias_maximum
    }

    /// Request the server to return response information in CONNACK.
    pub fn set_request_response_information(&mut self, request: bool) -> &mut Self {
        self.request_response_information = request;
        self
    }

    /// Get current request response information flag.
    #[must_use]
    pub const fn request_response_information(&self) -> bool {
        self.request_response_information
    }

    /// Allow the server to send reason strings and user properties on
    /// failures. Defaults to true.
    pub fn set_request_problem_information(&mut self, request: bool) -> &mut Self {
        self.request_problem_information = request;
        self
    }

    /// Get current request problem information flag.
    #[must_use]
    pub const fn request_problem_information(&self) -> bool {
        self.request_problem_information
    }

    /// Append one user property pair sent in the CONNECT packet.
    pub fn add_user_property(&mut self, key: &str, value: &str) -> &mut Self {
        self.user_properties
            .push((key.to_string(), value.to_string()));
        self
    }

    /// Get current user property list.
    #[must_use]
    pub fn user_properties(&self) -> &[(String, String)] {
        &self.user_properties
    }

    /// Update the last will and testament message.
    pub fn set_will(&mut self, will: Option<Will>) -> &mut Self {
        self.will = will;
        self
    }

    /// Get current will message.
    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    /// Update username.
    pub fn set_username(&mut self, username: Option<&str>) -> &mut Self {
        self.username = username.map(ToString::to_string);
        self
    }

    /// Get current username.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Update password.
    pub fn set_password(&mut self, password: Option<Password>) -> &mut Self {
        self.password = password;
        self
    }

    /// Get current password.
    #[must_use]
    pub const fn password(&self) -> Option<&Password> {
        self.password.as_ref()
    }

    /// Update extended authentication method.
    pub fn set_authentication_method(&mut self, method: Option<&str>) -> &mut Self {
        self.authentication_method = method.map(ToString::to_string);
        self
    }

    /// Get current extended authentication method.
    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        self.authentication_method.as_deref()
    }

    /// Update extended authentication data.
    pub fn set_authentication_data(&mut self, data: Option<&[u8]>) -> &mut Self {
        self.authentication_data = data.map(<[u8]>::to_vec);
        self
    }

    /// Get current extended authentication data.
    #[must_use]
    pub fn authentication_data(&self) -> Option<&[u8]> {
        self.authentication_data.as_deref()
    }

    /// Update transport connect timeout.
    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Get current transport connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Update the window in which CONNECT/SUBSCRIBE/UNSUBSCRIBE/PUBLISH
    /// wait for their response before failing with a timeout.
    pub fn set_response_timeout(&mut self, response_timeout: Duration) -> &mut Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Get current response timeout.
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Enable manual acknowledgement mode. Incoming `QoS` 1/2 messages are
    /// then only acknowledged when [`crate::Client::ack`] is called.
    pub fn set_manual_ack(&mut self, manual_ack: bool) -> &mut Self {
        self.manual_ack = manual_ack;
        self
    }

    /// Get current manual ack flag.
    #[must_use]
    pub const fn manual_ack(&self) -> bool {
        self.manual_ack
    }

    /// Update automatic reconnect options.
    pub fn set_reconnect(&mut self, reconnect: ReconnectOptions) -> &mut Self {
        self.reconnect = reconnect;
        self
    }

    /// Enable automatic reconnect with default delays.
    pub fn enable_reconnect(&mut self) -> &mut Self {
        self.reconnect.enabled = true;
        self
    }

    /// Get a reference to reconnect options.
    #[must_use]
    pub const fn reconnect(&self) -> &ReconnectOptions {
        &self.reconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_debug_is_redacted() {
        let password = Password::from("hunter2");
        assert_eq!(format!("{password:?}"), "Password(***)");
        assert_eq!(password.expose(), b"hunter2");
    }

    #[test]
    fn test_keep_alive_clamps() {
        let mut options = ConnectOptions::default();
        options.set_keep_alive(1_000_000);
        assert_eq!(options.keep_alive(), u16::MAX);
        options.set_keep_alive(0);
        assert_eq!(options.keep_alive(), 0);
    }

    #[test]
    fn test_generated_client_id() {
        let options = ConnectOptions::default();
        assert!(!options.client_id().is_empty());
        assert!(options.client_id().len() <= 23);
    }

    #[test]
    fn test_receive_maximum_zero_means_protocol_max() {
        let mut options = ConnectOptions::default();
        options.set_receive_maximum(0);
        assert_eq!(options.receive_maximum(), u16::MAX);
    }
}
