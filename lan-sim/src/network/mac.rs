use anyhow::{Context, bail};
use fastrand::Rng;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    /// A random unicast address with the locally administered bit set
    pub fn random(rng: &mut Rng) -> Self {
        let mut bytes = [0; 6];
        rng.fill(&mut bytes);
        bytes[0] = (bytes[0] & 0b1111_1100) | 0b0000_0010;
        Self(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<MacAddress> for pnet_base::MacAddr {
    fn from(mac: MacAddress) -> Self {
        let [a, b, c, d, e, f] = mac.0;
        pnet_base::MacAddr::new(a, b, c, d, e, f)
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Debug for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for MacAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 6];
        let mut parts = s.split([':', '-']);
        for byte in &mut bytes {
            let part = parts
                .next()
                .with_context(|| format!("mac address `{s}` has less than 6 octets"))?;
            if part.len() != 2 {
                bail!("invalid octet `{part}` in mac address `{s}`");
            }

            *byte = u8::from_str_radix(part, 16)
                .with_context(|| format!("invalid octet `{part}` in mac address `{s}`"))?;
        }

        if parts.next().is_some() {
            bail!("mac address `{s}` has more than 6 octets");
        }

        Ok(Self(bytes))
    }
}

#[test]
fn test_mac_address() {
    let mac: MacAddress = "00:1a:2B:3c:4D:5e".parse().unwrap();
    assert_eq!(mac.0, [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
    assert_eq!(mac.to_string(), "00:1A:2B:3C:4D:5E");
    assert_eq!("00-1A-2B-3C-4D-5E".parse::<MacAddress>().unwrap(), mac);

    for invalid in ["", "00:11:22:33:44", "00:11:22:33:44:55:66", "0:11:22:33:44:55", "zz:11:22:33:44:55"] {
        assert!(invalid.parse::<MacAddress>().is_err(), "{invalid}");
    }

    let mut rng = Rng::with_seed(42);
    for _ in 0..100 {
        let mac = MacAddress::random(&mut rng);
        assert_eq!(mac.0[0] & 0b11, 0b10);
        assert!(!mac.is_broadcast());
    }
}
