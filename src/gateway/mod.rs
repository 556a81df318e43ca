//! uPnP internet gateway client
//!
//! Discovers the LAN's IGD over SSDP, walks its device description for
//! the WANIPConnection control URL, and drives port mappings over SOAP.
//! Mappings are tagged with a configurable namespace in their
//! description so an instance only ever enumerates and deletes its own.

pub mod soap;
pub mod ssdp;

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::net::http::{http_exchange, http_get, parse_http_url};
use crate::net::NetError;

use soap::{
    extract_tag, parse_fault, soap_envelope, soap_request, SoapFault, FAULT_INDEX_INVALID,
    WANIP_SERVICE,
};

/// Upper bound on mapping-table enumeration, guarding against devices
/// that never answer fault 713.
const MAX_MAPPING_ENTRIES: u32 = 1024;

/// Errors from gateway discovery and SOAP exchanges.
#[derive(Debug)]
pub enum GatewayError {
    /// Discovery produced no gateway before the deadline
    NotFound,
    /// Structured SOAP fault from the device
    Fault(SoapFault),
    /// Non-200, non-fault HTTP status
    Http(u16),
    Io(String),
    /// The device description or a SOAP response was not understood
    Parse(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::NotFound => write!(f, "no internet gateway discovered"),
            GatewayError::Fault(fault) => {
                write!(f, "soap fault {}: {}", fault.code, fault.description)
            }
            GatewayError::Http(code) => write!(f, "unexpected http status {}", code),
            GatewayError::Io(e) => write!(f, "io error: {}", e),
            GatewayError::Parse(e) => write!(f, "parse error: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e.to_string())
    }
}

impl From<NetError> for GatewayError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Malformed(m) => GatewayError::Parse(m),
            other => GatewayError::Io(other.to_string()),
        }
    }
}

/// A port mapping as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: String,
    pub external_port: u16,
    pub internal_port: u16,
    pub internal_client: String,
    pub description: String,
    pub lease_duration: u32,
}

#[derive(Debug, Clone)]
struct ControlUrl {
    host: String,
    port: u16,
    path: String,
}

/// Client for the LAN's internet gateway device.
pub struct Gateway {
    namespace: String,
    discovery_timeout: Duration,
    control: Mutex<Option<ControlUrl>>,
}

impl Gateway {
    /// Create a client; discovery happens lazily on first use.
    pub fn new(namespace: impl Into<String>, discovery_timeout: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            discovery_timeout,
            control: Mutex::new(None),
        }
    }

    /// Discover the gateway and resolve its control URL. Idempotent.
    pub async fn ready(&self) -> Result<(), GatewayError> {
        let mut control = self.control.lock().await;
        if control.is_some() {
            return Ok(());
        }

        let location = ssdp::search(self.discovery_timeout).await?;
        let (status, description) = http_get(&location).await?;
        if status != 200 {
            return Err(GatewayError::Http(status));
        }
        let resolved = find_control_url(&description, &location)?;
        info!(
            host = %resolved.host,
            port = resolved.port,
            path = %resolved.path,
            "gateway control url resolved"
        );
        *control = Some(resolved);
        Ok(())
    }

    async fn control_url(&self) -> Result<ControlUrl, GatewayError> {
        self.ready().await?;
        Ok(self
            .control
            .lock()
            .await
            .clone()
            .expect("control url set by ready"))
    }

    async fn soap_call(
        &self,
        action: &str,
        args: &[(&str, String)],
    ) -> Result<String, GatewayError> {
        let control = self.control_url().await?;
        let envelope = soap_envelope(action, args);
        let request = soap_request(&control.host, control.port, &control.path, action, &envelope);
        let (status, body) = http_exchange(&control.host, control.port, &request).await?;
        match status {
            200 => Ok(body),
            500 => match parse_fault(&body) {
                Some(fault) => Err(GatewayError::Fault(fault)),
                None => Err(GatewayError::Http(500)),
            },
            other => Err(GatewayError::Http(other)),
        }
    }

    /// The gateway's WAN-side IPv4 address.
    pub async fn external_address(&self) -> Result<Ipv4Addr, GatewayError> {
        let body = self.soap_call("GetExternalIPAddress", &[]).await?;
        let raw = extract_tag(&body, "NewExternalIPAddress")
            .ok_or_else(|| GatewayError::Parse("missing NewExternalIPAddress".into()))?;
        raw.parse()
            .map_err(|_| GatewayError::Parse(format!("bad external address: {}", raw)))
    }

    /// Map `port` externally to the same port on every non-loopback
    /// IPv4 interface, sequentially. The mapping description carries
    /// this instance's namespace.
    pub async fn open_port(&self, protocol: &str, port: u16) -> Result<(), GatewayError> {
        let addresses = local_ipv4_addresses();
        if addresses.is_empty() {
            return Err(GatewayError::Io("no usable local interface".into()));
        }
        for address in addresses {
            self.soap_call(
                "AddPortMapping",
                &[
                    ("NewRemoteHost", String::new()),
                    ("NewExternalPort", port.to_string()),
                    ("NewProtocol", protocol.to_uppercase()),
                    ("NewInternalPort", port.to_string()),
                    ("NewInternalClient", address.to_string()),
                    ("NewEnabled", "1".to_string()),
                    ("NewPortMappingDescription", self.namespace.clone()),
                    ("NewLeaseDuration", "0".to_string()),
                ],
            )
            .await?;
            debug!(protocol = %protocol, port = port, client = %address, "port mapped");
        }
        Ok(())
    }

    /// Enumerate this instance's mappings (description == namespace).
    ///
    /// Walks the generic mapping table until the device answers fault
    /// 713 for an out-of-range index.
    pub async fn list_open_ports(&self) -> Result<Vec<PortMapping>, GatewayError> {
        let mut mappings = Vec::new();
        for index in 0..MAX_MAPPING_ENTRIES {
            let body = match self
                .soap_call(
                    "GetGenericPortMappingEntry",
                    &[("NewPortMappingIndex", index.to_string())],
                )
                .await
            {
                Ok(body) => body,
                Err(GatewayError::Fault(fault)) if fault.code == FAULT_INDEX_INVALID => break,
                Err(e) => return Err(e),
            };
            let mapping = parse_mapping_entry(&body)?;
            if mapping.description == self.namespace {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// Delete mappings.
    ///
    /// With both protocol and port, deletes that single mapping.
    /// Otherwise enumerates this instance's own mappings, narrows by
    /// protocol when given, and deletes each. Mappings created by
    /// others are never touched.
    pub async fn close_port(
        &self,
        protocol: Option<&str>,
        port: Option<u16>,
    ) -> Result<(), GatewayError> {
        if let (Some(protocol), Some(port)) = (protocol, port) {
            return self.delete_mapping(protocol, port).await;
        }
        for mapping in self.list_open_ports().await? {
            if !mapping_matches(&mapping, protocol, port) {
                continue;
            }
            self.delete_mapping(&mapping.protocol, mapping.external_port)
                .await?;
        }
        Ok(())
    }

    async fn delete_mapping(&self, protocol: &str, port: u16) -> Result<(), GatewayError> {
        self.soap_call(
            "DeletePortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", port.to_string()),
                ("NewProtocol", protocol.to_uppercase()),
            ],
        )
        .await?;
        debug!(protocol = %protocol, port = port, "port mapping deleted");
        Ok(())
    }
}

/// Walk the device description depth-first for the WANIPConnection
/// service and resolve its control URL against the description's base.
fn find_control_url(description: &str, location: &str) -> Result<ControlUrl, GatewayError> {
    let mut rest = description;
    while let Some(start) = rest.find("<service>") {
        let after = &rest[start + "<service>".len()..];
        let end = match after.find("</service>") {
            Some(e) => e,
            None => break,
        };
        let block = &after[..end];
        if extract_tag(block, "serviceType") == Some(WANIP_SERVICE) {
            let control = extract_tag(block, "controlURL")
                .ok_or_else(|| GatewayError::Parse("service without controlURL".into()))?;
            return resolve_control_url(control, location);
        }
        rest = &after[end..];
    }
    Err(GatewayError::Parse(
        "no WANIPConnection service in device description".into(),
    ))
}

fn resolve_control_url(control: &str, location: &str) -> Result<ControlUrl, GatewayError> {
    if control.starts_with("http://") {
        let (host, port, path) = parse_http_url(control)?;
        return Ok(ControlUrl { host, port, path });
    }
    let (host, port, _) = parse_http_url(location)?;
    let path = if control.starts_with('/') {
        control.to_string()
    } else {
        format!("/{}", control)
    };
    Ok(ControlUrl { host, port, path })
}

fn parse_mapping_entry(body: &str) -> Result<PortMapping, GatewayError> {
    let tag = |name: &str| {
        extract_tag(body, name)
            .map(|s| s.to_string())
            .ok_or_else(|| GatewayError::Parse(format!("mapping entry missing {}", name)))
    };
    let port = |name: &str| -> Result<u16, GatewayError> {
        tag(name)?
            .parse()
            .map_err(|_| GatewayError::Parse(format!("bad {}", name)))
    };
    Ok(PortMapping {
        protocol: tag("NewProtocol")?,
        external_port: port("NewExternalPort")?,
        internal_port: port("NewInternalPort")?,
        internal_client: tag("NewInternalClient")?,
        description: extract_tag(body, "NewPortMappingDescription")
            .unwrap_or("")
            .to_string(),
        lease_duration: extract_tag(body, "NewLeaseDuration")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    })
}

fn mapping_matches(mapping: &PortMapping, protocol: Option<&str>, port: Option<u16>) -> bool {
    if let Some(protocol) = protocol {
        if !mapping.protocol.eq_ignore_ascii_case(protocol) {
            return false;
        }
    }
    if let Some(port) = port {
        if mapping.external_port != port {
            return false;
        }
    }
    true
}

/// Every non-loopback IPv4 address on this host.
fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let addresses: Vec<Ipv4Addr> = default_net::interface::get_interfaces()
        .into_iter()
        .flat_map(|iface| iface.ipv4.into_iter().map(|net| net.addr))
        .filter(|addr| !addr.is_loopback() && !addr.is_unspecified())
        .collect();
    if addresses.is_empty() {
        warn!("no non-loopback ipv4 interface found");
    }
    addresses
}
