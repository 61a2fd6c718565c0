//! Endpoint identity.
//!
//! Contact format: `host:port`
//!
//! A contact can arrive either as text (`"127.0.0.1:4000"`) or as a record
//! (`{"host": "127.0.0.1", "port": 4000}`). Both forms are resolved once, at
//! the boundary, into a canonical [`Contact`].

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// A network endpoint in the form `host:port`.
///
/// A port that could not be parsed is kept as `None` rather than rejected;
/// such a contact is still usable as a key, it just never names a reachable
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "ContactForm")]
pub struct Contact {
    host: String,
    port: Option<u16>,
}

impl Contact {
    /// Create a contact from a host and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }

    /// Resolve either representation into a contact.
    pub fn decode(form: impl Into<ContactForm>) -> Self {
        Self::from(form.into())
    }

    /// The host part (not validated; may be empty).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, or `None` if the source text carried no valid port.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host:port`, with an empty port when it is invalid.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Address string suitable for dialing.
    pub fn socket_addr(&self) -> Option<String> {
        self.port.map(|port| format!("{}:{}", self.host, port))
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}:", self.host),
        }
    }
}

impl FromStr for Contact {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.split_once(':').unwrap_or((s, ""));
        Ok(Self {
            host: host.to_string(),
            port: port.parse().ok(),
        })
    }
}

impl From<&str> for Contact {
    fn from(s: &str) -> Self {
        Self::decode(s)
    }
}

impl From<String> for Contact {
    fn from(s: String) -> Self {
        Self::decode(s)
    }
}

impl From<&Contact> for Contact {
    fn from(contact: &Contact) -> Self {
        contact.clone()
    }
}

impl<H: Into<String>> From<(H, u16)> for Contact {
    fn from((host, port): (H, u16)) -> Self {
        Self::new(host, port)
    }
}

/// The two shapes a contact takes on the wire or at the API boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ContactForm {
    /// `"host:port"`.
    Text(String),
    /// `{"host": .., "port": ..}`; other fields are ignored.
    Record {
        host: String,
        #[serde(default)]
        port: serde_json::Value,
    },
}

impl From<ContactForm> for Contact {
    fn from(form: ContactForm) -> Self {
        match form {
            ContactForm::Text(text) => match text.parse() {
                Ok(contact) => contact,
                Err(never) => match never {},
            },
            ContactForm::Record { host, port } => Self {
                host,
                port: port.as_u64().and_then(|p| u16::try_from(p).ok()),
            },
        }
    }
}

impl From<&str> for ContactForm {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ContactForm {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&Contact> for ContactForm {
    fn from(contact: &Contact) -> Self {
        Self::Record {
            host: contact.host.clone(),
            port: contact.port.map_or(serde_json::Value::Null, Into::into),
        }
    }
}

/// Whether two contact-like inputs name the same endpoint.
pub fn equal(a: impl Into<ContactForm>, b: impl Into<ContactForm>) -> bool {
    Contact::decode(a) == Contact::decode(b)
}

/// First entry of `list` equal to `target`.
pub fn find<'a>(list: &'a [Contact], target: &Contact) -> Option<&'a Contact> {
    list.iter().find(|c| *c == target)
}

/// Every entry of `list` except those equal to `target`, order preserved.
pub fn excluding(list: &[Contact], target: &Contact) -> Vec<Contact> {
    list.iter().filter(|c| *c != target).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_from_string() {
        let contact = Contact::decode("127.0.0.1:1234");
        assert_eq!(contact.host(), "127.0.0.1");
        assert_eq!(contact.port(), Some(1234));
    }

    #[test]
    fn encode_from_record() {
        let record: ContactForm =
            serde_json::from_value(serde_json::json!({ "id": 0, "host": "127.0.0.1", "port": 1234 }))
                .unwrap();
        assert_eq!(Contact::decode(record).encode(), "127.0.0.1:1234");
    }

    #[test]
    fn string_and_record_are_equal() {
        let from_text = Contact::decode("127.0.0.1:1234");
        let from_record: Contact =
            serde_json::from_value(serde_json::json!({ "host": "127.0.0.1", "port": 1234 })).unwrap();
        assert_eq!(from_text, from_record);
        assert_eq!(from_record, from_text);
        assert_eq!(from_text, from_text.clone());

        assert!(equal("127.0.0.1:1234", &from_record));
        assert!(equal(&from_record, "127.0.0.1:1234"));
        assert!(!equal("127.0.0.1:1234", "127.0.0.1:1235"));
        assert!(equal("host:x", "host:y"));
    }

    #[test]
    fn roundtrip() {
        let contact = Contact::new("localhost", 22222);
        assert_eq!(Contact::decode(contact.encode()), contact);
        assert_eq!(Contact::decode("example.org:80").to_string(), "example.org:80");
    }

    #[test]
    fn malformed_port_is_invalid_not_an_error() {
        let contact = Contact::decode("host:abc");
        assert_eq!(contact.host(), "host");
        assert_eq!(contact.port(), None);
        assert_eq!(contact.to_string(), "host:");
        assert_eq!(contact.socket_addr(), None);

        assert_eq!(Contact::decode("nocolon").port(), None);
        assert_eq!(Contact::decode("host:70000").port(), None);
        assert_eq!(Contact::decode("a:1:2").port(), None);
    }

    #[test]
    fn empty_host_is_legal() {
        let contact = Contact::decode(":9000");
        assert_eq!(contact.host(), "");
        assert_eq!(contact.port(), Some(9000));
    }

    #[test]
    fn serializes_as_record() {
        let value = serde_json::to_value(Contact::new("localhost", 22222)).unwrap();
        assert_eq!(value, serde_json::json!({ "host": "localhost", "port": 22222 }));
    }

    #[test]
    fn find_and_excluding() {
        let list = vec![
            Contact::new("a", 1),
            Contact::new("b", 2),
            Contact::new("a", 1),
        ];
        let target = Contact::decode("a:1");
        assert_eq!(find(&list, &target), Some(&list[0]));
        assert_eq!(find(&list, &Contact::new("c", 3)), None);
        assert_eq!(excluding(&list, &target), vec![Contact::new("b", 2)]);
    }
}
