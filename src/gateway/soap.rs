//! SOAP message construction and parsing
//!
//! Only the IGDv1 WANIPConnection exchange is handled: flat argument
//! lists in, flat result tags out, plus the UPnPError fault shape. The
//! tag extraction is a plain scan in the same spirit as the hand-rolled
//! HTTP header helpers.

/// The WANIPConnection:1 service type all actions are addressed to.
pub const WANIP_SERVICE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// A structured SOAP fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: i32,
    pub description: String,
}

/// Fault code the device answers when a mapping enumeration index is
/// past the end of the table ("SpecifiedArrayIndexInvalid").
pub const FAULT_INDEX_INVALID: i32 = 713;

/// Extract the text content of the first `<tag>…</tag>` occurrence.
///
/// Matches both plain and namespaced forms (`<tag>` / `<ns:tag>`), which
/// is all the IGD responses in the wild use.
pub fn extract_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let close = format!("</{}>", tag);
    let mut search = 0;
    loop {
        let open_at = xml[search..].find(&format!("<{}", tag))? + search;
        // reject prefix matches like <tagfoo>
        let after_name = xml[open_at + 1 + tag.len()..].chars().next()?;
        if after_name != '>' && !after_name.is_whitespace() {
            search = open_at + 1;
            continue;
        }
        let content_at = xml[open_at..].find('>')? + open_at + 1;
        let end = xml[content_at..].find(&close)? + content_at;
        return Some(xml[content_at..end].trim());
    }
}

/// Build the SOAP envelope for a WANIPConnection action.
pub fn soap_envelope(action: &str, args: &[(&str, String)]) -> String {
    let mut params = String::new();
    for (name, value) in args {
        params.push_str(&format!("<{}>{}</{}>", name, value, name));
    }
    format!(
        "<?xml version=\"1.0\"?>\r\n\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{service}\">{params}</u:{action}></s:Body>\
         </s:Envelope>",
        action = action,
        service = WANIP_SERVICE,
        params = params
    )
}

/// Build the full HTTP POST for a SOAP action against a control URL.
pub fn soap_request(host: &str, port: u16, path: &str, action: &str, envelope: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Content-Type: text/xml; charset=\"utf-8\"\r\n\
         Content-Length: {len}\r\n\
         SOAPACTION: \"{service}#{action}\"\r\n\
         Connection: close\r\n\r\n{envelope}",
        path = path,
        host = host,
        port = port,
        len = envelope.len(),
        service = WANIP_SERVICE,
        action = action,
        envelope = envelope
    )
}

/// Parse a UPnPError fault out of a 500 response body.
pub fn parse_fault(body: &str) -> Option<SoapFault> {
    let code = extract_tag(body, "errorCode")?.parse().ok()?;
    let description = extract_tag(body, "errorDescription")
        .unwrap_or("")
        .to_string();
    Some(SoapFault { code, description })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tag() {
        let xml = "<root><NewExternalIPAddress>203.0.113.5</NewExternalIPAddress></root>";
        assert_eq!(extract_tag(xml, "NewExternalIPAddress"), Some("203.0.113.5"));
        assert_eq!(extract_tag(xml, "Missing"), None);
    }

    #[test]
    fn test_extract_tag_with_attributes_and_namespace() {
        let xml = r#"<u:GetExternalIPAddressResponse xmlns:u="urn:x"><ip>1.2.3.4</ip></u:GetExternalIPAddressResponse>"#;
        assert_eq!(extract_tag(xml, "ip"), Some("1.2.3.4"));
        let xml = r#"<tag attr="v"> spaced </tag>"#;
        assert_eq!(extract_tag(xml, "tag"), Some("spaced"));
    }

    #[test]
    fn test_extract_tag_rejects_prefix_names() {
        let xml = "<serviceTypeList>x</serviceTypeList><serviceType>y</serviceType>";
        assert_eq!(extract_tag(xml, "serviceType"), Some("y"));
    }

    #[test]
    fn test_soap_envelope_shape() {
        let env = soap_envelope(
            "AddPortMapping",
            &[
                ("NewExternalPort", "8080".to_string()),
                ("NewProtocol", "TCP".to_string()),
            ],
        );
        assert!(env.starts_with("<?xml version=\"1.0\"?>"));
        assert!(env.contains("<u:AddPortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">"));
        assert!(env.contains("<NewExternalPort>8080</NewExternalPort>"));
        assert!(env.contains("<NewProtocol>TCP</NewProtocol>"));
        assert!(env.ends_with("</s:Body></s:Envelope>"));
    }

    #[test]
    fn test_soap_request_headers() {
        let req = soap_request("192.168.1.1", 5000, "/ctl/IPConn", "GetExternalIPAddress", "<x/>");
        assert!(req.starts_with("POST /ctl/IPConn HTTP/1.1\r\n"));
        assert!(req.contains(
            "SOAPACTION: \"urn:schemas-upnp-org:service:WANIPConnection:1#GetExternalIPAddress\"\r\n"
        ));
        assert!(req.contains("Content-Length: 4\r\n"));
        assert!(req.ends_with("\r\n\r\n<x/>"));
    }

    #[test]
    fn test_parse_fault() {
        let body = r#"<s:Envelope><s:Body><s:Fault>
            <detail><UPnPError>
                <errorCode>713</errorCode>
                <errorDescription>SpecifiedArrayIndexInvalid</errorDescription>
            </UPnPError></detail>
        </s:Fault></s:Body></s:Envelope>"#;
        let fault = parse_fault(body).unwrap();
        assert_eq!(fault.code, FAULT_INDEX_INVALID);
        assert_eq!(fault.description, "SpecifiedArrayIndexInvalid");
    }

    #[test]
    fn test_parse_fault_without_error_code() {
        assert_eq!(parse_fault("<s:Envelope></s:Envelope>"), None);
    }
}
