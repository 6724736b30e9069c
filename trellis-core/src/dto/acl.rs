//! Network ACL entries

use serde::{Deserialize, Serialize};

/// Protocol matched by an ACL entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclProtocol {
    All,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Allow,
    Deny,
}

/// One numbered, stateless ACL rule
///
/// Entries are evaluated in ascending `rule_number` order per direction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AclEntry {
    pub egress: bool,
    pub rule_number: u16,
    pub protocol: AclProtocol,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
    pub action: AclAction,
}

impl AclEntry {
    /// Inbound allow rule for a port range
    pub fn allow_inbound(
        rule_number: u16,
        protocol: AclProtocol,
        from_port: u16,
        to_port: u16,
        cidr: impl Into<String>,
    ) -> Self {
        Self {
            egress: false,
            rule_number,
            protocol,
            from_port,
            to_port,
            cidr: cidr.into(),
            action: AclAction::Allow,
        }
    }

    /// Outbound allow-everything rule
    pub fn allow_all_outbound(rule_number: u16) -> Self {
        Self {
            egress: true,
            rule_number,
            protocol: AclProtocol::All,
            from_port: 0,
            to_port: u16::MAX,
            cidr: "0.0.0.0/0".to_string(),
            action: AclAction::Allow,
        }
    }
}
