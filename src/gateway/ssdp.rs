//! SSDP discovery
//!
//! One M-SEARCH datagram to the well-known multicast group, then
//! collect unicast answers until the deadline. The first response with
//! a 200 status line and a LOCATION header wins.

use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::net::parse::{header_value, parse_status_line};

use super::GatewayError;

/// Well-known SSDP multicast address.
pub const SSDP_ADDR: &str = "239.255.255.250:1900";
/// Search target: IGDv1 root device.
pub const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// Search for an internet gateway; returns the device description URL.
pub async fn search(timeout: Duration) -> Result<String, GatewayError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let msearch = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {}\r\n\r\n",
        SSDP_ADDR, SEARCH_TARGET
    );
    socket.send_to(msearch.as_bytes(), SSDP_ADDR).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 4096];
    loop {
        let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(GatewayError::NotFound),
        };
        let response = String::from_utf8_lossy(&buf[..n]);
        match parse_search_response(&response) {
            Some(location) => {
                debug!(from = %from, location = %location, "gateway discovered");
                return Ok(location);
            }
            None => trace!(from = %from, "ignoring ssdp response"),
        }
    }
}

/// Extract the LOCATION header from a valid 200 search response.
pub fn parse_search_response(response: &str) -> Option<String> {
    let status = parse_status_line(response.lines().next()?)?;
    if status != 200 {
        return None;
    }
    header_value(response, "location").map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_response() {
        let response = "HTTP/1.1 200 OK\r\n\
                        CACHE-CONTROL: max-age=120\r\n\
                        ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
                        LOCATION: http://192.168.1.1:5000/rootDesc.xml\r\n\r\n";
        assert_eq!(
            parse_search_response(response),
            Some("http://192.168.1.1:5000/rootDesc.xml".to_string())
        );
    }

    #[test]
    fn test_parse_search_response_rejects_non_200() {
        let response = "HTTP/1.1 503 Unavailable\r\nLOCATION: http://x/\r\n\r\n";
        assert_eq!(parse_search_response(response), None);
    }

    #[test]
    fn test_parse_search_response_requires_location() {
        let response = "HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n";
        assert_eq!(parse_search_response(response), None);
    }
}
