use anyhow::{Context, anyhow, bail};
use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// An IPv4 address together with its network prefix length (e.g. 10.0.1.5/24)
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub(crate) address: Ipv4Addr,
    pub(crate) prefix_len: u8,
}

impl Ipv4Cidr {
    /// 0.0.0.0/0, matching every address
    pub const DEFAULT_ROUTE: Ipv4Cidr = Ipv4Cidr {
        address: Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
    };

    pub fn new(address: Ipv4Addr, prefix_len: u8) -> anyhow::Result<Self> {
        if prefix_len > 32 {
            bail!("network prefix cannot be higher than 32");
        }

        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Builds a cidr out of a dotted subnet mask, which must consist of contiguous one bits
    pub fn from_mask(address: Ipv4Addr, mask: Ipv4Addr) -> anyhow::Result<Self> {
        let bits = mask.to_bits();
        let prefix_len = bits.leading_ones();
        if bits.checked_shl(prefix_len).unwrap_or(0) != 0 {
            bail!("subnet mask {mask} is not contiguous");
        }

        Self::new(address, prefix_len as u8)
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(prefix_mask(self.prefix_len))
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.address.to_bits() & prefix_mask(self.prefix_len))
    }

    /// The same network, with the host bits cleared
    pub fn network_cidr(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            address: self.network(),
            prefix_len: self.prefix_len,
        }
    }

    /// The directed broadcast address of the network
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.address.to_bits() | !prefix_mask(self.prefix_len))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix_len);
        ip.to_bits() & mask == self.address.to_bits() & mask
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl Debug for Ipv4Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    // Accepts both 10.0.0.1/24 and 10.0.0.1/255.255.255.0
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let address: IpAddr = parts
            .next()
            .ok_or(anyhow!("empty string"))?
            .parse()
            .with_context(|| format!("invalid ip address in `{s}`"))?;

        let IpAddr::V4(address) = address else {
            bail!("only IPv4 is supported");
        };

        // A missing network prefix is interpreted as /32 (i.e. a single host)
        let prefix = parts.next().unwrap_or("32");
        let cidr = if prefix.contains('.') {
            let mask: Ipv4Addr = prefix
                .parse()
                .with_context(|| format!("invalid subnet mask in `{s}`"))?;
            Self::from_mask(address, mask)?
        } else {
            let prefix_len: u8 = prefix
                .parse()
                .context("the provided network prefix is not a valid unsigned integer")?;
            Self::new(address, prefix_len)?
        };

        if parts.next().is_some() {
            bail!("cidr contains trailing characters");
        }

        Ok(cidr)
    }
}

#[test]
fn test_ipv4_cidr() {
    let cases = [
        ("10.0.0.0/24", "10.0.0.0", "10.0.0.255", "255.255.255.0"),
        ("10.0.0.123/24", "10.0.0.0", "10.0.0.255", "255.255.255.0"),
        ("10.0.0.0/8", "10.0.0.0", "10.255.255.255", "255.0.0.0"),
        ("20.0.0.0/12", "20.0.0.0", "20.15.255.255", "255.240.0.0"),
        ("192.168.1.7/255.255.255.0", "192.168.1.0", "192.168.1.255", "255.255.255.0"),
        ("192.168.1.7", "192.168.1.7", "192.168.1.7", "255.255.255.255"),
        ("0.0.0.0/0", "0.0.0.0", "255.255.255.255", "0.0.0.0"),
    ];

    for (input, network, broadcast, mask) in cases {
        let cidr = Ipv4Cidr::from_str(input).unwrap();
        assert_eq!(cidr.network().to_string(), network);
        assert_eq!(cidr.broadcast().to_string(), broadcast);
        assert_eq!(cidr.mask().to_string(), mask);
        assert!(cidr.contains(cidr.network()));
        assert!(cidr.contains(cidr.broadcast()));
    }

    let cidr: Ipv4Cidr = "10.1.0.0/16".parse().unwrap();
    assert!(cidr.contains(Ipv4Addr::new(10, 1, 200, 3)));
    assert!(!cidr.contains(Ipv4Addr::new(10, 2, 0, 1)));
    assert!(Ipv4Cidr::DEFAULT_ROUTE.contains(Ipv4Addr::new(1, 2, 3, 4)));

    for invalid in ["", "10.0.0.1/33", "10.0.0.1/255.0.255.0", "::1/64", "10.0.0.1/8/8"] {
        assert!(Ipv4Cidr::from_str(invalid).is_err(), "{invalid}");
    }
}
