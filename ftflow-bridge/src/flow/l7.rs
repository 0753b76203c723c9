use std::fmt;
use std::str::FromStr;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Application protocol attached to a flow.
///
/// The table only guesses from well-known ports; it does not inspect
/// payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum L7Protocol {
    #[default]
    Unknown,
    Http,
    Tls,
    Quic,
    Dns,
    Ssh,
    Smtp,
    Imap,
    Pop3,
    Ftp,
    Ntp,
    Dhcp,
    Snmp,
    Bgp,
}

impl L7Protocol {
    pub const ALL: [L7Protocol; 14] = [
        L7Protocol::Unknown,
        L7Protocol::Http,
        L7Protocol::Tls,
        L7Protocol::Quic,
        L7Protocol::Dns,
        L7Protocol::Ssh,
        L7Protocol::Smtp,
        L7Protocol::Imap,
        L7Protocol::Pop3,
        L7Protocol::Ftp,
        L7Protocol::Ntp,
        L7Protocol::Dhcp,
        L7Protocol::Snmp,
        L7Protocol::Bgp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            L7Protocol::Unknown => "Unknown",
            L7Protocol::Http => "HTTP",
            L7Protocol::Tls => "TLS",
            L7Protocol::Quic => "QUIC",
            L7Protocol::Dns => "DNS",
            L7Protocol::Ssh => "SSH",
            L7Protocol::Smtp => "SMTP",
            L7Protocol::Imap => "IMAP",
            L7Protocol::Pop3 => "POP3",
            L7Protocol::Ftp => "FTP",
            L7Protocol::Ntp => "NTP",
            L7Protocol::Dhcp => "DHCP",
            L7Protocol::Snmp => "SNMP",
            L7Protocol::Bgp => "BGP",
        }
    }

    /// Guess from transport protocol and ports. The lower-numbered
    /// recognised port wins so ephemeral client ports don't shadow it.
    pub fn guess(protocol: u8, sport: u16, dport: u16) -> Self {
        let (low, high) = if sport <= dport { (sport, dport) } else { (dport, sport) };
        match Self::by_port(protocol, low) {
            L7Protocol::Unknown => Self::by_port(protocol, high),
            found => found,
        }
    }

    fn by_port(protocol: u8, port: u16) -> Self {
        match (protocol, port) {
            (IPPROTO_TCP, 80 | 8080) => L7Protocol::Http,
            (IPPROTO_TCP, 443 | 8443) => L7Protocol::Tls,
            (IPPROTO_UDP, 443) => L7Protocol::Quic,
            (IPPROTO_TCP | IPPROTO_UDP, 53) => L7Protocol::Dns,
            (IPPROTO_TCP, 22) => L7Protocol::Ssh,
            (IPPROTO_TCP, 25 | 587) => L7Protocol::Smtp,
            (IPPROTO_TCP, 143 | 993) => L7Protocol::Imap,
            (IPPROTO_TCP, 110 | 995) => L7Protocol::Pop3,
            (IPPROTO_TCP, 20 | 21) => L7Protocol::Ftp,
            (IPPROTO_UDP, 123) => L7Protocol::Ntp,
            (IPPROTO_UDP, 67 | 68) => L7Protocol::Dhcp,
            (IPPROTO_UDP, 161 | 162) => L7Protocol::Snmp,
            (IPPROTO_TCP, 179) => L7Protocol::Bgp,
            _ => L7Protocol::Unknown,
        }
    }
}

impl fmt::Display for L7Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for L7Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown L7 protocol '{}'", wanted))
    }
}
