//! Parser for `Server=...;Port=...;Tls=...` connection strings.
//!
//! Keys are case-insensitive and unrecognised keys are ignored. Parsing is pure: the
//! certificate is recorded as a path (or inline PEM text) and only read when the
//! session transport is built.

use super::ConfigurationError;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

const PEM_MARKER: &str = "-----BEGIN";

#[derive(Clone, PartialEq, Eq)]
pub enum CertificateSource {
    Path(PathBuf),
    Inline(Vec<u8>),
}

impl fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            CertificateSource::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
        }
    }
}

/// Immutable description of one logical MQTT connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    name: String,
    server: String,
    port: u16,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    tls: bool,
    certificate: Option<CertificateSource>,
}

impl ConnectionDescriptor {
    /// Builds a descriptor directly, applying the same defaults as [`parse`].
    pub fn new(
        name: impl Into<String>,
        server: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        let server = server.into();
        if server.trim().is_empty() {
            return Err(ConfigurationError::MissingServer { name });
        }

        Ok(Self {
            name,
            server: server.trim().to_string(),
            port: DEFAULT_PORT,
            client_id: generate_client_id(),
            username: None,
            password: None,
            tls: false,
            certificate: None,
        })
    }

    /// Enables TLS; the port follows unless it was set explicitly afterwards.
    pub fn with_tls(mut self, tls: bool) -> Self {
        if self.port == default_port(self.tls) {
            self.port = default_port(tls);
        }
        self.tls = tls;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn with_certificate(mut self, certificate: CertificateSource) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn certificate(&self) -> Option<&CertificateSource> {
        self.certificate.as_ref()
    }

    /// Checks the invariants a descriptor must hold, used for externally built values.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.server.trim().is_empty() {
            return Err(ConfigurationError::MissingServer {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("certificate", &self.certificate)
            .finish()
    }
}

pub fn parse(raw: &str, name: &str) -> Result<ConnectionDescriptor, ConfigurationError> {
    let mut server = None;
    let mut port = None;
    let mut client_id = None;
    let mut username = None;
    let mut password = None;
    let mut tls = None;
    let mut certificate = None;

    for segment in split_segments(raw) {
        if segment.trim().is_empty() {
            continue;
        }

        let (key, value) =
            segment
                .split_once('=')
                .ok_or_else(|| ConfigurationError::MalformedSegment {
                    name: name.to_string(),
                    segment: segment.trim().to_string(),
                })?;
        let value = unquote(value.trim());

        match key.trim().to_ascii_lowercase().as_str() {
            "server" => server = Some(value.to_string()),
            "port" => {
                let parsed =
                    value
                        .parse::<u16>()
                        .map_err(|_| ConfigurationError::InvalidPort {
                            name: name.to_string(),
                            value: value.to_string(),
                        })?;
                port = Some(parsed);
            }
            "clientid" => client_id = Some(value.to_string()),
            "username" => username = Some(value.to_string()),
            "password" => password = Some(value.to_string()),
            "tls" => tls = Some(parse_bool(value).ok_or_else(|| ConfigurationError::InvalidTls {
                name: name.to_string(),
                value: value.to_string(),
            })?),
            "certificate" => certificate = certificate_source(value),
            _ => {}
        }
    }

    let server = server
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigurationError::MissingServer {
            name: name.to_string(),
        })?;
    let tls = tls.unwrap_or(false);

    Ok(ConnectionDescriptor {
        name: name.to_string(),
        server,
        port: port.unwrap_or_else(|| default_port(tls)),
        client_id: client_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_client_id),
        username: username.filter(|user| !user.is_empty()),
        password,
        tls,
        certificate,
    })
}

fn default_port(tls: bool) -> u16 {
    if tls {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PORT
    }
}

fn generate_client_id() -> String {
    format!("mqtt-bindings-{}", Uuid::new_v4())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn certificate_source(value: &str) -> Option<CertificateSource> {
    if value.is_empty() {
        None
    } else if value.starts_with(PEM_MARKER) {
        Some(CertificateSource::Inline(value.as_bytes().to_vec()))
    } else {
        Some(CertificateSource::Path(PathBuf::from(value)))
    }
}

/// Splits on `;`, except inside a value that opens with a quote.
fn split_segments(raw: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut quote = None;
    let mut seen_equals = false;
    let mut at_value_start = false;

    for (index, ch) in raw.char_indices() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            ';' => {
                segments.push(&raw[start..index]);
                start = index + 1;
                seen_equals = false;
                at_value_start = false;
            }
            '=' if !seen_equals => {
                seen_equals = true;
                at_value_start = true;
            }
            '"' | '\'' if at_value_start => {
                quote = Some(ch);
                at_value_start = false;
            }
            ch if ch.is_whitespace() => {}
            _ => at_value_start = false,
        }
    }
    segments.push(&raw[start..]);
    segments
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
