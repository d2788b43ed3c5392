//! Relay authorisation: which peers may submit mail, and which recipient
//! domains the relay will accept it for.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::VerifyError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verifier {
    domains: Vec<String>,
    subnets: Vec<IpNet>,
}

impl Verifier {
    /// `domains` are expected lower-cased. An entry starting with `.` matches
    /// any subdomain of what follows, but not that domain itself.
    pub fn new(domains: impl IntoIterator<Item = String>, subnets: impl IntoIterator<Item = IpNet>) -> Self {
        Self {
            domains: domains.into_iter().collect(),
            subnets: subnets.into_iter().collect(),
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn subnets(&self) -> &[IpNet] {
        &self.subnets
    }

    /// Whether `address` is deliverable through this relay, judged only by the
    /// part after the last `@`. Addresses without a local part or a domain
    /// are never allowed.
    pub fn is_recipient_domain_allowed(&self, address: &str) -> bool {
        let Some((local, domain)) = address.rsplit_once('@') else {
            return false;
        };

        if local.is_empty() || domain.is_empty() {
            return false;
        }

        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|allowed| {
            if allowed.starts_with('.') {
                domain.ends_with(allowed.as_str())
            } else {
                domain == *allowed
            }
        })
    }

    /// Whether `peer` sits inside one of the permitted subnets.
    ///
    /// IPv4-mapped IPv6 peers (`::ffff:a.b.c.d`) are matched as IPv4, which is
    /// how they show up on a dual-stack listener.
    pub fn is_source_allowed(&self, peer: IpAddr) -> bool {
        let peer = match peer {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(peer, IpAddr::V4),
            IpAddr::V4(_) => peer,
        };

        self.subnets.iter().any(|subnet| subnet.contains(&peer))
    }

    /// Check one `RCPT TO` from `peer`. The source is checked first.
    ///
    /// # Errors
    /// If either the peer or the recipient's domain is not permitted
    pub fn verify(&self, peer: IpAddr, recipient: &str) -> Result<(), VerifyError> {
        if !self.is_source_allowed(peer) {
            return Err(VerifyError::Source(peer));
        }

        if !self.is_recipient_domain_allowed(recipient) {
            return Err(VerifyError::Domain(recipient.to_owned()));
        }

        Ok(())
    }
}
