/// CIDR 地址范围解析与枚举
///
/// 计数包含网络地址与广播地址（/P 共 2^(32-P) 个），枚举按数值升序，惰性生成。

use common::{Error, Result};
use ipnet::{IpNet, Ipv4Net};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// 一个 IPv4 地址范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    net: Ipv4Net,
}

impl AddressRange {
    /// 解析 `a.b.c.d/P`，主机位会被清零
    pub fn parse(cidr: &str) -> Result<Self> {
        let net: IpNet = cidr
            .trim()
            .parse()
            .map_err(|e| Error::InvalidRange(format!("{}: {}", cidr, e)))?;

        match net {
            IpNet::V4(v4) => Ok(Self { net: v4.trunc() }),
            IpNet::V6(_) => Err(Error::InvalidRange(format!("仅支持 IPv4 网段: {}", cidr))),
        }
    }

    /// 解析并限制最宽前缀，避免一次枚举过多地址
    pub fn parse_bounded(cidr: &str, min_prefix_len: u8) -> Result<Self> {
        let range = Self::parse(cidr)?;
        if range.prefix_len() < min_prefix_len {
            return Err(Error::InvalidRange(format!(
                "网段过大: {} (最宽允许 /{})",
                cidr, min_prefix_len
            )));
        }
        Ok(range)
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// 地址总数 2^(32-P)
    pub fn count(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len()))
    }

    /// 按升序枚举所有地址
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + Send + 'static {
        let start = u32::from(self.net.network());
        let end = u32::from(self.net.broadcast());
        (start..=end).map(|n| IpAddr::V4(Ipv4Addr::from(n)))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.net.contains(v4),
            IpAddr::V6(_) => false,
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

/// 解析 CIDR，返回有序地址列表与地址数
pub fn parse(cidr: &str) -> Result<(Vec<IpAddr>, u64)> {
    let range = AddressRange::parse(cidr)?;
    Ok((range.addresses().collect(), range.count()))
}

/// 判断字符串形式的 IP 是否属于网段
pub fn contains(range: &AddressRange, ip: &str) -> bool {
    ip.parse::<IpAddr>()
        .map(|ip| range.contains(&ip))
        .unwrap_or(false)
}
