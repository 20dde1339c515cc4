// ============================================
// File: crates/vpngate-core/src/subnet.rs
// ============================================
//! # Subnet Allocator
//!
//! ## Creation Reason
//! Several OpenVPN instances share one gateway host. Each needs its own
//! client address block, carved out of a single configured base network.
//!
//! ## Main Functionality
//! - `SubnetAllocator`: splits a base network into equal subnets
//! - `Subnet`: one block plus the host addresses OpenVPN is started with
//!
//! ## Address Layout (per /29 example)
//! ```text
//!  .0      .1      .2      .3                    .6      .7
//! ┌──────┬───────┬───────┬───────┬─────────────┬──────┬──────────┐
//! │ net  │ first │second │ third │     ...     │ last │broadcast │
//! └──────┴───────┴───────┴───────┴─────────────┴──────┴──────────┘
//!          gateway ifconfig  └──── ifconfig-pool ────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Masks above /29 are rejected: the layout above needs at least
//!   three usable hosts
//! - The base address is truncated to its network address first, so
//!   `10.1.2.3/16` splits exactly like `10.1.0.0/16`
//! - `instance_subnet` walks the iterator lazily; a /10 split into /29
//!   has half a million entries and must not be collected for one lookup
//!
//! ## Last Modified
//! v0.3.0 - Replaces the per-client IP pool with per-instance subnets

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use tracing::debug;

use vpngate_common::InstanceId;

use crate::error::{CoreError, Result};

// ============================================
// Constants
// ============================================

/// Narrowest mask that still leaves gateway, peer and a pool.
pub const MAX_SUBNET_MASK: u8 = 29;

// ============================================
// Subnet
// ============================================

/// An immutable address block assigned to one OpenVPN instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    net: Ipv4Net,
}

impl Subnet {
    /// Network (base) address.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.net.network()
    }

    /// Prefix length.
    #[must_use]
    pub fn bitmask(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Dotted netmask, as OpenVPN's `--route` expects it.
    #[must_use]
    pub fn netmask(&self) -> Ipv4Addr {
        self.net.netmask()
    }

    /// First usable host, the default gateway.
    #[must_use]
    pub fn first(&self) -> Ipv4Addr {
        self.host(1)
    }

    /// Second usable host, the server side of `--ifconfig`.
    #[must_use]
    pub fn second(&self) -> Ipv4Addr {
        self.host(2)
    }

    /// Third usable host, start of the client pool.
    #[must_use]
    pub fn third(&self) -> Ipv4Addr {
        self.host(3)
    }

    /// Last usable host before broadcast, end of the client pool.
    #[must_use]
    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.net.broadcast()) - 1)
    }

    /// Start of the client address pool.
    #[must_use]
    pub fn pool_start(&self) -> Ipv4Addr {
        self.third()
    }

    /// End of the client address pool.
    #[must_use]
    pub fn pool_end(&self) -> Ipv4Addr {
        self.last()
    }

    /// Returns `true` if `addr` lies inside this block.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(&addr)
    }

    /// Number of addresses in the block, including network and broadcast.
    #[must_use]
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.bitmask()))
    }

    /// Underlying `ipnet` value.
    #[must_use]
    pub const fn as_net(&self) -> Ipv4Net {
        self.net
    }

    fn host(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.net.network()) + offset)
    }
}

impl From<Ipv4Net> for Subnet {
    fn from(net: Ipv4Net) -> Self {
        Self { net: net.trunc() }
    }
}

impl fmt::Debug for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subnet({})", self.net)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

// ============================================
// SubnetAllocator
// ============================================

/// Splits a base network into equally sized per-instance subnets.
///
/// # Example
/// ```
/// use vpngate_core::subnet::SubnetAllocator;
///
/// let allocator: SubnetAllocator = "10.240.0.0/16".parse().unwrap();
/// let subnets = allocator.split(18).unwrap();
///
/// assert_eq!(subnets.len(), 4);
/// assert_eq!(subnets[1].to_string(), "10.240.64.0/18");
/// assert_eq!(subnets[1].second().to_string(), "10.240.64.2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetAllocator {
    base: Ipv4Net,
}

impl SubnetAllocator {
    /// Creates an allocator over `base`, truncated to its network address.
    #[must_use]
    pub fn new(base: Ipv4Net) -> Self {
        Self { base: base.trunc() }
    }

    /// The (truncated) base network.
    #[must_use]
    pub const fn base(&self) -> Ipv4Net {
        self.base
    }

    /// Default per-instance mask: enough bits to give every instance its
    /// own block, i.e. `base_mask + ceil(log2(instance_count))`.
    #[must_use]
    pub fn default_mask(&self, instance_count: u16) -> u8 {
        let count = u32::from(instance_count.max(1));
        let extra_bits = count.next_power_of_two().trailing_zeros();
        // `extra_bits` is at most 16, so the sum always fits in a u8
        self.base.prefix_len().saturating_add(extra_bits as u8)
    }

    /// Produces every `/mask` subnet inside the base, in ascending order.
    ///
    /// # Errors
    /// - `MaskWiderThanBase` if `mask` is below the base prefix length
    /// - `MaskTooNarrow` if `mask` exceeds [`MAX_SUBNET_MASK`]
    pub fn split(&self, mask: u8) -> Result<Vec<Subnet>> {
        self.check_mask(mask)?;
        let subnets: Vec<Subnet> = self
            .base
            .subnets(mask)
            .map_err(|e| CoreError::invalid_network(self.base.to_string(), e.to_string()))?
            .map(Subnet::from)
            .collect();
        debug!(base = %self.base, mask, count = subnets.len(), "Split base network");
        Ok(subnets)
    }

    /// Returns the subnet owned by `instance` without materialising the
    /// whole split.
    ///
    /// # Errors
    /// Mask errors as for [`Self::split`], or `Common(OutOfRange)` if the
    /// instance index exceeds the number of subnets.
    pub fn instance_subnet(&self, instance: InstanceId, mask: u8) -> Result<Subnet> {
        self.check_mask(mask)?;
        let capacity = 1u64 << (u32::from(mask) - u32::from(self.base.prefix_len()));
        self.base
            .subnets(mask)
            .map_err(|e| CoreError::invalid_network(self.base.to_string(), e.to_string()))?
            .nth(usize::from(instance.offset()))
            .map(Subnet::from)
            .ok_or_else(|| {
                vpngate_common::CommonError::out_of_range(
                    "instance",
                    i64::from(instance.get()),
                    1,
                    i64::try_from(capacity).unwrap_or(i64::MAX),
                )
                .into()
            })
    }

    fn check_mask(&self, mask: u8) -> Result<()> {
        if mask < self.base.prefix_len() {
            return Err(CoreError::MaskWiderThanBase {
                base: self.base.prefix_len(),
                requested: mask,
            });
        }
        if mask > MAX_SUBNET_MASK {
            return Err(CoreError::MaskTooNarrow { requested: mask });
        }
        Ok(())
    }
}

impl FromStr for SubnetAllocator {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let base: Ipv4Net = s
            .trim()
            .parse()
            .map_err(|e: ipnet::AddrParseError| CoreError::invalid_network(s, e.to_string()))?;
        Ok(Self::new(base))
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(base: &str) -> SubnetAllocator {
        base.parse().unwrap()
    }

    #[test]
    fn test_split_count_and_order() {
        for (base, mask) in [("10.240.0.0/16", 18), ("100.64.0.0/10", 14), ("192.168.0.0/24", 29)] {
            let alloc = allocator(base);
            let subnets = alloc.split(mask).unwrap();
            let expected = 1usize << (mask - alloc.base().prefix_len());
            assert_eq!(subnets.len(), expected, "{base} -> /{mask}");

            for pair in subnets.windows(2) {
                let end = u64::from(u32::from(pair[0].network())) + pair[0].size();
                assert_eq!(u64::from(u32::from(pair[1].network())), end);
            }
            assert!(subnets.iter().all(|s| s.bitmask() == mask));
            assert_eq!(subnets[0].network(), alloc.base().network());
        }
    }

    #[test]
    fn test_split_same_mask_is_identity() {
        let subnets = allocator("10.0.0.0/24").split(24).unwrap();
        assert_eq!(subnets.len(), 1);
        assert_eq!(subnets[0].to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_split_rejects_bad_masks() {
        let alloc = allocator("10.240.0.0/16");
        assert!(matches!(alloc.split(8), Err(CoreError::MaskWiderThanBase { base: 16, requested: 8 })));
        assert!(matches!(alloc.split(30), Err(CoreError::MaskTooNarrow { requested: 30 })));
        // allocator is a value type; a failed split leaves it usable
        assert_eq!(alloc.split(17).unwrap().len(), 2);
    }

    #[test]
    fn test_host_addresses() {
        let subnet = allocator("10.240.0.0/16").split(29).unwrap()[1];
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 240, 0, 8));
        assert_eq!(subnet.first(), Ipv4Addr::new(10, 240, 0, 9));
        assert_eq!(subnet.second(), Ipv4Addr::new(10, 240, 0, 10));
        assert_eq!(subnet.third(), Ipv4Addr::new(10, 240, 0, 11));
        assert_eq!(subnet.last(), Ipv4Addr::new(10, 240, 0, 14));
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 255, 248));
        assert!(subnet.contains(subnet.pool_end()));
    }

    #[test]
    fn test_unaligned_base_is_truncated() {
        let alloc = allocator("10.1.2.3/16");
        assert_eq!(alloc.base().to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_default_mask() {
        let alloc = allocator("100.64.0.0/10");
        assert_eq!(alloc.default_mask(1), 10);
        assert_eq!(alloc.default_mask(2), 11);
        assert_eq!(alloc.default_mask(3), 12);
        assert_eq!(alloc.default_mask(8), 13);
    }

    #[test]
    fn test_instance_subnet() {
        let alloc = allocator("100.64.0.0/10");
        let third = alloc.instance_subnet(InstanceId::new(3).unwrap(), 12).unwrap();
        assert_eq!(third.to_string(), "100.96.0.0/12");

        let err = alloc.instance_subnet(InstanceId::new(5).unwrap(), 12).unwrap_err();
        assert!(matches!(err, CoreError::Common(_)));
    }

    #[test]
    fn test_invalid_base() {
        assert!("not-a-network".parse::<SubnetAllocator>().is_err());
        assert!("10.0.0.0".parse::<SubnetAllocator>().is_err());
    }
}
