//! Wake-on-LAN magic packet construction and sending

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use tokio::net::UdpSocket;
use tracing::debug;

/// Discard port; WoL listeners only look at the payload
const WOL_PORT: u16 = 9;

/// A parsed hardware (MAC) address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address '{}': expected 6 octets", s));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address '{}': bad octet '{}'", s, part))?;
        }
        Ok(MacAddr(octets))
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Build the magic packet: 6 bytes of 0xFF followed by the MAC repeated 16 times
fn magic_packet(mac: &MacAddr) -> [u8; 102] {
    let mut packet = [0xFFu8; 102];
    for repetition in 0..16 {
        let offset = 6 + repetition * 6;
        packet[offset..offset + 6].copy_from_slice(&mac.octets());
    }
    packet
}

/// Broadcast a magic packet for the given MAC address.
///
/// Fire and forget: a successful send says nothing about whether the host
/// heard it. The caller owns retry via its probe polling.
pub async fn send_magic_packet(mac: &MacAddr) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, WOL_PORT);
    socket.send_to(&magic_packet(mac), target).await?;

    debug!(mac = %mac, "Wake packet broadcast");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_separated() {
        let mac: MacAddr = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);
    }

    #[test]
    fn test_parse_dash_separated() {
        let mac: MacAddr = "AA-BB-CC-DD-EE-FF".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-a-mac".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac: MacAddr = "01:02:03:04:05:06".parse().unwrap();
        let packet = magic_packet(&mac);

        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|&b| b == 0xFF));
        for repetition in 0..16 {
            let offset = 6 + repetition * 6;
            assert_eq!(&packet[offset..offset + 6], &[1, 2, 3, 4, 5, 6]);
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let mac: MacAddr = serde_json::from_str("\"de:ad:be:ef:00:01\"").unwrap();
        assert_eq!(serde_json::to_string(&mac).unwrap(), "\"de:ad:be:ef:00:01\"");
    }
}
