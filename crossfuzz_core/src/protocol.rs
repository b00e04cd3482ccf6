use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol a job fuzzes.
///
/// The four built-in protocols are always known by name. `Other` covers protocols added by
/// registering an extra driver; whether a protocol is usable is decided by the
/// [`DriverRegistry`](crate::driver::DriverRegistry), not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Icmp,
    Ssh,
    Tcp,
    Snmp,
    Other(String),
}

impl Protocol {
    pub const BUILTIN: [Protocol; 4] = [Protocol::Icmp, Protocol::Ssh, Protocol::Tcp, Protocol::Snmp];

    pub fn name(&self) -> &str {
        match self {
            Protocol::Icmp => "ICMP",
            Protocol::Ssh => "SSH",
            Protocol::Tcp => "TCP",
            Protocol::Snmp => "SNMP",
            Protocol::Other(name) => name,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("protocol name is empty".to_string());
        }
        let upper = trimmed.to_ascii_uppercase();
        Ok(match upper.as_str() {
            "ICMP" => Protocol::Icmp,
            "SSH" => Protocol::Ssh,
            "TCP" => Protocol::Tcp,
            "SNMP" => Protocol::Snmp,
            _ => Protocol::Other(upper),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_parse_in_any_case() {
        assert_eq!("icmp".parse::<Protocol>().unwrap(), Protocol::Icmp);
        assert_eq!(" Ssh ".parse::<Protocol>().unwrap(), Protocol::Ssh);
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("snmp".parse::<Protocol>().unwrap(), Protocol::Snmp);
    }

    #[test]
    fn unknown_names_become_other_and_keep_display() {
        let quic: Protocol = "quic".parse().unwrap();
        assert_eq!(quic, Protocol::Other("QUIC".to_string()));
        assert_eq!(quic.to_string(), "QUIC");
        assert!("   ".parse::<Protocol>().is_err());
    }
}
