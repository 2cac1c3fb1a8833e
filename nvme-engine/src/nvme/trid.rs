//! Transport identifiers: how to reach a controller.
//!
//! The textual form is a sequence of `key:value` tokens separated by
//! whitespace, e.g.
//! `trtype:RDMA adrfam:IPv4 traddr:192.0.2.1 trsvcid:4420`.
//! Formatting a parsed identifier and parsing it again yields the same
//! structure.

use std::fmt;

use strum_macros::{Display, EnumString};

use crate::nvme::{
    NvmeError,
    DISCOVERY_NQN,
    NQN_MAX_LEN,
    TRADDR_MAX_LEN,
    TRSVCID_MAX_LEN,
};

/// Transport kinds the registry can dispatch on.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Display, EnumString,
)]
#[derive(Serialize, Deserialize)]
#[strum(ascii_case_insensitive)]
pub enum TransportType {
    #[strum(serialize = "PCIe")]
    Pcie,
    #[strum(serialize = "RDMA")]
    Rdma,
    #[strum(serialize = "TCP")]
    Tcp,
    #[strum(serialize = "VFIOUSER")]
    VfioUser,
    #[strum(serialize = "CUSTOM")]
    Custom,
}

/// Address family of a fabrics address.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Display, EnumString,
)]
#[derive(Serialize, Deserialize)]
#[strum(ascii_case_insensitive)]
pub enum AddressFamily {
    #[strum(serialize = "IPv4")]
    Ipv4,
    #[strum(serialize = "IPv6")]
    Ipv6,
    #[strum(serialize = "IB")]
    Ib,
    #[strum(serialize = "FC")]
    Fc,
}

/// A structured description of how to reach one controller.
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(Serialize, Deserialize)]
pub struct TransportId {
    pub trtype: TransportType,
    pub adrfam: Option<AddressFamily>,
    pub traddr: String,
    pub trsvcid: String,
    pub subnqn: String,
}

impl Default for TransportId {
    fn default() -> Self {
        Self {
            trtype: TransportType::Pcie,
            adrfam: None,
            traddr: String::new(),
            trsvcid: String::new(),
            subnqn: DISCOVERY_NQN.to_string(),
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trtype:{}", self.trtype)?;
        if let Some(adrfam) = self.adrfam {
            write!(f, " adrfam:{}", adrfam)?;
        }
        if !self.traddr.is_empty() {
            write!(f, " traddr:{}", self.traddr)?;
        }
        if !self.trsvcid.is_empty() {
            write!(f, " trsvcid:{}", self.trsvcid)?;
        }
        if !self.subnqn.is_empty() {
            write!(f, " subnqn:{}", self.subnqn)?;
        }
        Ok(())
    }
}

/// A trid plus the per-attach extras carried in the same string.
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(Serialize, Deserialize)]
pub struct TridEntry {
    pub trid: TransportId,
    /// namespace to use; zero means all active namespaces
    pub nsid: u16,
    pub hostnqn: String,
    /// where to fail over to; a copy of `trid` with `alt_traddr`
    /// substituted when one was given
    pub failover: TransportId,
}

impl Default for TridEntry {
    fn default() -> Self {
        let trid = TransportId::default();
        Self {
            failover: trid.clone(),
            trid,
            nsid: 0,
            hostnqn: String::new(),
        }
    }
}

impl fmt::Display for TridEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.trid)?;
        if self.nsid != 0 {
            write!(f, " ns:{}", self.nsid)?;
        }
        if !self.hostnqn.is_empty() {
            write!(f, " hostnqn:{}", self.hostnqn)?;
        }
        if self.failover.traddr != self.trid.traddr {
            write!(f, " alt_traddr:{}", self.failover.traddr)?;
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> NvmeError {
    NvmeError::InvalidArgument {
        reason: reason.into(),
    }
}

impl TridEntry {
    /// Parse a `key:value` token string. Unknown keys are an error;
    /// missing keys keep their defaults (PCIe, the discovery NQN).
    pub fn parse(text: &str) -> Result<Self, NvmeError> {
        let mut entry = TridEntry::default();
        let mut alt_traddr: Option<String> = None;

        for token in text.split_whitespace() {
            let (key, value) = token
                .find(':')
                .map(|idx| (&token[.. idx], &token[idx + 1 ..]))
                .ok_or_else(|| {
                    invalid(format!(
                        "expected key:value, got '{}'",
                        token
                    ))
                })?;

            match key.to_ascii_lowercase().as_str() {
                "trtype" => {
                    entry.trid.trtype =
                        value.parse::<TransportType>().map_err(|_| {
                            invalid(format!(
                                "unknown transport type '{}'",
                                value
                            ))
                        })?;
                }
                "adrfam" => {
                    entry.trid.adrfam = Some(
                        value.parse::<AddressFamily>().map_err(|_| {
                            invalid(format!(
                                "unknown address family '{}'",
                                value
                            ))
                        })?,
                    );
                }
                "traddr" => {
                    if value.len() > TRADDR_MAX_LEN {
                        return Err(invalid("traddr is too long"));
                    }
                    entry.trid.traddr = value.to_string();
                }
                "trsvcid" => {
                    if value.len() > TRSVCID_MAX_LEN {
                        return Err(invalid("trsvcid is too long"));
                    }
                    entry.trid.trsvcid = value.to_string();
                }
                "subnqn" => {
                    if value.len() > NQN_MAX_LEN {
                        return Err(invalid("subnqn is too long"));
                    }
                    entry.trid.subnqn = value.to_string();
                }
                "ns" => {
                    if value.len() > 5 {
                        return Err(invalid(
                            "namespace ids have at most 5 digits",
                        ));
                    }
                    let nsid: u32 = value.parse().map_err(|_| {
                        invalid(format!("bad namespace id '{}'", value))
                    })?;
                    if nsid == 0 || nsid > 65535 {
                        return Err(invalid(
                            "namespace ids are between 1 and 65535",
                        ));
                    }
                    entry.nsid = nsid as u16;
                }
                "hostnqn" => {
                    if value.len() > NQN_MAX_LEN {
                        return Err(invalid("hostnqn is too long"));
                    }
                    entry.hostnqn = value.to_string();
                }
                "alt_traddr" => {
                    if value.len() > TRADDR_MAX_LEN {
                        return Err(invalid("alt_traddr is too long"));
                    }
                    alt_traddr = Some(value.to_string());
                }
                _ => {
                    return Err(invalid(format!(
                        "unknown transport id key '{}'",
                        key
                    )));
                }
            }
        }

        // the failover target is the primary with the address swapped
        entry.failover = entry.trid.clone();
        if let Some(traddr) = alt_traddr {
            entry.failover.traddr = traddr;
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fabric_trid() {
        let entry = TridEntry::parse(
            "trtype:RDMA adrfam:IPv4 traddr:192.0.2.1 trsvcid:4420 \
             subnqn:nqn.2024-01.example:foo ns:1 \
             hostnqn:nqn.2024-01.host:bar",
        )
        .unwrap();

        assert_eq!(entry.trid.trtype, TransportType::Rdma);
        assert_eq!(entry.trid.adrfam, Some(AddressFamily::Ipv4));
        assert_eq!(entry.trid.traddr, "192.0.2.1");
        assert_eq!(entry.trid.trsvcid, "4420");
        assert_eq!(entry.trid.subnqn, "nqn.2024-01.example:foo");
        assert_eq!(entry.nsid, 1);
        assert_eq!(entry.hostnqn, "nqn.2024-01.host:bar");
    }

    #[test]
    fn parse_defaults() {
        let entry = TridEntry::parse("traddr:0000:81:00.0").unwrap();
        assert_eq!(entry.trid.trtype, TransportType::Pcie);
        assert_eq!(entry.trid.subnqn, DISCOVERY_NQN);
        assert_eq!(entry.nsid, 0);
        assert_eq!(entry.failover.traddr, entry.trid.traddr);
    }

    #[test]
    fn trtype_is_case_insensitive() {
        for text in &["trtype:pcie", "trtype:PCIE", "trtype:PCIe"] {
            let entry = TridEntry::parse(text).unwrap();
            assert_eq!(entry.trid.trtype, TransportType::Pcie);
        }
    }

    #[test]
    fn unknown_key_is_an_error() {
        assert!(TridEntry::parse("trtype:TCP bogus:1").is_err());
        assert!(TridEntry::parse("no-separator").is_err());
    }

    #[test]
    fn nsid_bounds() {
        assert!(TridEntry::parse("ns:0").is_err());
        assert!(TridEntry::parse("ns:65536").is_err());
        assert!(TridEntry::parse("ns:123456").is_err());
        assert_eq!(TridEntry::parse("ns:65535").unwrap().nsid, 65535);
    }

    #[test]
    fn alt_traddr_builds_failover() {
        let entry = TridEntry::parse(
            "trtype:TCP traddr:10.0.0.1 trsvcid:4420 \
             alt_traddr:10.0.0.2",
        )
        .unwrap();
        assert_eq!(entry.trid.traddr, "10.0.0.1");
        assert_eq!(entry.failover.traddr, "10.0.0.2");
        assert_eq!(entry.failover.trsvcid, "4420");
    }

    #[test]
    fn format_parse_round_trip() {
        let texts = [
            "trtype:RDMA adrfam:IPv4 traddr:192.0.2.1 trsvcid:4420 \
             subnqn:nqn.2024-01.example:foo ns:1 \
             hostnqn:nqn.2024-01.host:bar",
            "trtype:PCIe traddr:0000:81:00.0",
            "trtype:TCP adrfam:IPv6 traddr:::1 trsvcid:4420 \
             alt_traddr:::2",
        ];
        for text in &texts {
            let parsed = TridEntry::parse(text).unwrap();
            let formatted = parsed.to_string();
            let reparsed = TridEntry::parse(&formatted).unwrap();
            assert_eq!(parsed, reparsed, "round trip of '{}'", text);
        }
    }
}
