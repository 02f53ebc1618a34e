//! Bitmap IP address allocator.
//!
//! Every subnet gets a fixed-size bit set with one bit per address, scanned
//! first-fit. Bit `i` stands for `network + i + 1`, so the first allocation
//! in a fresh subnet is the gateway (`.1`) and containers follow from `.2`.
//! The broadcast address is never handed out.
//!
//! State lives in one JSON file keyed by canonical CIDR; each entry carries
//! its own version so entries can evolve independently. Every operation is
//! a locked load-mutate-store cycle.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use capsule_common::error::{CapsuleError, Result};
use capsule_common::store;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// Current on-disk entry version.
pub const ENTRY_VERSION: u32 = 1;

/// Widest subnet the allocator accepts.
pub const MIN_PREFIX: u8 = 8;

const WORD_BITS: usize = 64;
const WORD_HEX: usize = 16;

/// Fixed-size bit set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    len: usize,
    words: Vec<u64>,
}

impl Bitmap {
    /// All-clear bit set of `len` bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(WORD_BITS)],
        }
    }

    /// Number of bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// `true` for a zero-length set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads bit `i`; out-of-range bits read as clear.
    #[must_use]
    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.words[i / WORD_BITS] & (1 << (i % WORD_BITS)) != 0
    }

    /// Sets or clears bit `i`. Out-of-range indices are ignored.
    pub fn set(&mut self, i: usize, value: bool) {
        if i >= self.len {
            return;
        }
        let mask = 1 << (i % WORD_BITS);
        if value {
            self.words[i / WORD_BITS] |= mask;
        } else {
            self.words[i / WORD_BITS] &= !mask;
        }
    }

    /// First clear bit below `limit`.
    #[must_use]
    pub fn first_clear(&self, limit: usize) -> Option<usize> {
        let limit = limit.min(self.len);
        self.words
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != u64::MAX)
            .map(|(n, w)| n * WORD_BITS + w.trailing_ones() as usize)
            .find(|i| *i < limit)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Hex encoding, lowest word first.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.words.iter().map(|w| format!("{w:016x}")).collect()
    }

    /// Decodes [`Self::to_hex`] output for a set of `len` bits.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] if the string has the wrong length or
    /// is not hexadecimal.
    pub fn from_hex(len: usize, hex: &str) -> Result<Self> {
        let words = len.div_ceil(WORD_BITS);
        if hex.len() != words * WORD_HEX {
            return Err(CapsuleError::Config {
                message: format!(
                    "bitmap of {len} bits needs {} hex digits, found {}",
                    words * WORD_HEX,
                    hex.len()
                ),
            });
        }
        let words = hex
            .as_bytes()
            .chunks(WORD_HEX)
            .map(|chunk| {
                std::str::from_utf8(chunk)
                    .ok()
                    .and_then(|s| u64::from_str_radix(s, 16).ok())
                    .ok_or_else(|| CapsuleError::Config {
                        message: "bitmap is not hexadecimal".into(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { len, words })
    }
}

/// Persisted state of one subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetEntry {
    /// Entry format version.
    pub version: u32,
    /// Bits in the bitmap (addresses in the subnet).
    pub size: usize,
    /// Hex-encoded bitmap.
    pub bitmap: String,
}

impl SubnetEntry {
    fn decode(&self, key: &str) -> Result<Bitmap> {
        if self.version != ENTRY_VERSION {
            return Err(CapsuleError::Config {
                message: format!("unsupported IPAM entry version {} for {key}", self.version),
            });
        }
        Bitmap::from_hex(self.size, &self.bitmap)
    }

    fn encode(bitmap: &Bitmap) -> Self {
        Self {
            version: ENTRY_VERSION,
            size: bitmap.len(),
            bitmap: bitmap.to_hex(),
        }
    }
}

type IpamState = BTreeMap<String, SubnetEntry>;

/// File-backed allocator.
#[derive(Debug, Clone)]
pub struct Ipam {
    path: PathBuf,
}

impl Ipam {
    /// Creates an allocator persisting to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserves the first free address in `subnet`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::AddressExhausted`] when every assignable
    /// address is taken, [`CapsuleError::Config`] for subnets wider than
    /// `/8`, or a store error.
    pub fn allocate(&self, subnet: &Ipv4Network) -> Result<Ipv4Addr> {
        let subnet = canonical(subnet)?;
        let key = subnet.to_string();
        let assignable = assignable(&subnet);

        let _lock = store::lock_exclusive(&self.path)?;
        let mut state = self.load()?;
        let mut bitmap = match state.get(&key) {
            Some(entry) => entry.decode(&key)?,
            None => Bitmap::new(subnet_size(&subnet)),
        };

        let index = bitmap
            .first_clear(assignable)
            .ok_or_else(|| CapsuleError::AddressExhausted { subnet: key.clone() })?;
        bitmap.set(index, true);
        let address = index_to_addr(&subnet, index)?;

        let _ = state.insert(key.clone(), SubnetEntry::encode(&bitmap));
        store::write_json(&self.path, &state)?;
        tracing::debug!(subnet = %key, ip = %address, "address allocated");
        Ok(address)
    }

    /// Returns `address` to the pool of `subnet`.
    ///
    /// Releasing an address that is not currently allocated is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Config`] if `address` is not an assignable
    /// address of `subnet`, or a store error.
    pub fn release(&self, subnet: &Ipv4Network, address: Ipv4Addr) -> Result<()> {
        let subnet = canonical(subnet)?;
        let key = subnet.to_string();
        let index = addr_to_index(&subnet, address)?;

        let _lock = store::lock_exclusive(&self.path)?;
        let mut state = self.load()?;
        let Some(entry) = state.get(&key) else {
            tracing::warn!(subnet = %key, ip = %address, "release from unknown subnet ignored");
            return Ok(());
        };
        let mut bitmap = entry.decode(&key)?;
        if !bitmap.get(index) {
            tracing::warn!(subnet = %key, ip = %address, "address was not allocated");
            return Ok(());
        }
        bitmap.set(index, false);

        let _ = state.insert(key.clone(), SubnetEntry::encode(&bitmap));
        store::write_json(&self.path, &state)?;
        tracing::debug!(subnet = %key, ip = %address, "address released");
        Ok(())
    }

    /// Addresses currently reserved in `subnet`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be read.
    pub fn allocated(&self, subnet: &Ipv4Network) -> Result<Vec<Ipv4Addr>> {
        let subnet = canonical(subnet)?;
        let key = subnet.to_string();
        let Some(entry) = self.load()?.remove(&key) else {
            return Ok(Vec::new());
        };
        let bitmap = entry.decode(&key)?;
        (0..bitmap.len())
            .filter(|i| bitmap.get(*i))
            .map(|i| index_to_addr(&subnet, i))
            .collect()
    }

    fn load(&self) -> Result<IpamState> {
        Ok(store::read_json(&self.path)?.unwrap_or_default())
    }
}

/// Normalises `subnet` to its network address.
fn canonical(subnet: &Ipv4Network) -> Result<Ipv4Network> {
    if subnet.prefix() < MIN_PREFIX {
        return Err(CapsuleError::Config {
            message: format!("subnet {subnet} is wider than /{MIN_PREFIX}"),
        });
    }
    Ipv4Network::new(subnet.network(), subnet.prefix()).map_err(|e| CapsuleError::Config {
        message: format!("invalid subnet {subnet}: {e}"),
    })
}

fn subnet_size(subnet: &Ipv4Network) -> usize {
    1_usize << (32 - u32::from(subnet.prefix()))
}

/// Bits that map below the broadcast address.
fn assignable(subnet: &Ipv4Network) -> usize {
    subnet_size(subnet).saturating_sub(2)
}

fn index_to_addr(subnet: &Ipv4Network, index: usize) -> Result<Ipv4Addr> {
    let offset = u32::try_from(index + 1).map_err(|_| CapsuleError::AddressExhausted {
        subnet: subnet.to_string(),
    })?;
    Ok(Ipv4Addr::from(u32::from(subnet.network()) + offset))
}

fn addr_to_index(subnet: &Ipv4Network, address: Ipv4Addr) -> Result<usize> {
    let base = u32::from(subnet.network());
    let raw = u32::from(address);
    let out_of_range = || CapsuleError::Config {
        message: format!("{address} is not an assignable address of {subnet}"),
    };
    let index = raw
        .checked_sub(base)
        .and_then(|d| d.checked_sub(1))
        .ok_or_else(out_of_range)? as usize;
    if index >= assignable(subnet) {
        return Err(out_of_range());
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().expect("cidr")
    }

    fn ipam() -> (tempfile::TempDir, Ipam) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Ipam::new(dir.path().join("ipam/subnet.json"));
        (dir, ipam)
    }

    #[test]
    fn first_allocations_are_gateway_then_hosts() {
        let (_dir, ipam) = ipam();
        let subnet = net("192.168.0.0/24");
        let got: Vec<_> = (0..3).map(|_| ipam.allocate(&subnet).expect("alloc")).collect();
        assert_eq!(
            got,
            vec![
                Ipv4Addr::new(192, 168, 0, 1),
                Ipv4Addr::new(192, 168, 0, 2),
                Ipv4Addr::new(192, 168, 0, 3),
            ]
        );

        let state: IpamState = store::read_json(ipam.path()).expect("read").expect("present");
        let entry = &state["192.168.0.0/24"];
        assert_eq!(entry.version, ENTRY_VERSION);
        assert_eq!(entry.size, 256);
        assert_eq!(entry.decode("k").expect("decode").count_ones(), 3);
    }

    #[test]
    fn subnet_is_normalised_before_lookup() {
        let (_dir, ipam) = ipam();
        let a = ipam.allocate(&net("10.0.0.1/24")).expect("alloc");
        let b = ipam.allocate(&net("10.0.0.77/24")).expect("alloc");
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(b, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn released_address_is_reused() {
        let (_dir, ipam) = ipam();
        let subnet = net("172.18.0.0/24");
        let _gateway = ipam.allocate(&subnet).expect("gateway");
        let first = ipam.allocate(&subnet).expect("first");
        let _second = ipam.allocate(&subnet).expect("second");

        ipam.release(&subnet, first).expect("release");
        assert_eq!(ipam.allocate(&subnet).expect("again"), first);
    }

    #[test]
    fn small_subnet_exhausts_before_broadcast() {
        let (_dir, ipam) = ipam();
        let subnet = net("10.1.0.0/29");
        let got: Vec<_> = (0..6).map(|_| ipam.allocate(&subnet).expect("alloc")).collect();
        assert_eq!(got.last(), Some(&Ipv4Addr::new(10, 1, 0, 6)));
        assert!(got.iter().all(|ip| subnet.contains(*ip)));

        let err = ipam.allocate(&subnet).expect_err("exhausted");
        assert!(matches!(err, CapsuleError::AddressExhausted { .. }));
    }

    #[test]
    fn allocations_are_distinct_and_in_subnet() {
        let (_dir, ipam) = ipam();
        let subnet = net("10.9.0.0/26");
        let mut got: Vec<_> = std::iter::from_fn(|| ipam.allocate(&subnet).ok()).collect();
        assert_eq!(got.len(), 62);
        assert!(got.iter().all(|ip| subnet.contains(*ip)));
        assert!(!got.contains(&subnet.network()));
        assert!(!got.contains(&subnet.broadcast()));
        got.dedup();
        assert_eq!(got.len(), 62);
    }

    #[test]
    fn state_survives_new_instance() {
        let (dir, ipam) = ipam();
        let subnet = net("10.2.0.0/24");
        let _ = ipam.allocate(&subnet).expect("alloc");
        let other = Ipam::new(dir.path().join("ipam/subnet.json"));
        assert_eq!(other.allocate(&subnet).expect("alloc"), Ipv4Addr::new(10, 2, 0, 2));
        assert_eq!(
            other.allocated(&subnet).expect("list"),
            vec![Ipv4Addr::new(10, 2, 0, 1), Ipv4Addr::new(10, 2, 0, 2)]
        );
    }

    #[test]
    fn subnets_are_independent() {
        let (_dir, ipam) = ipam();
        let _ = ipam.allocate(&net("10.3.0.0/24")).expect("alloc");
        assert_eq!(
            ipam.allocate(&net("10.4.0.0/24")).expect("alloc"),
            Ipv4Addr::new(10, 4, 0, 1)
        );
    }

    #[test]
    fn release_outside_subnet_is_rejected() {
        let (_dir, ipam) = ipam();
        let subnet = net("10.5.0.0/24");
        let _ = ipam.allocate(&subnet).expect("alloc");
        for bad in [
            Ipv4Addr::new(10, 6, 0, 1),
            subnet.network(),
            subnet.broadcast(),
        ] {
            let err = ipam.release(&subnet, bad).expect_err("rejected");
            assert!(matches!(err, CapsuleError::Config { .. }), "{bad}");
        }
    }

    #[test]
    fn double_release_is_harmless() {
        let (_dir, ipam) = ipam();
        let subnet = net("10.7.0.0/24");
        let ip = ipam.allocate(&subnet).expect("alloc");
        ipam.release(&subnet, ip).expect("release");
        ipam.release(&subnet, ip).expect("release again");
        assert!(ipam.allocated(&subnet).expect("list").is_empty());
    }

    #[test]
    fn too_wide_subnet_is_rejected() {
        let (_dir, ipam) = ipam();
        let err = ipam.allocate(&net("10.0.0.0/7")).expect_err("too wide");
        assert!(matches!(err, CapsuleError::Config { .. }));
    }

    #[test]
    fn bitmap_hex_is_stable() {
        let mut bitmap = Bitmap::new(130);
        bitmap.set(0, true);
        bitmap.set(65, true);
        bitmap.set(129, true);
        let hex = bitmap.to_hex();
        assert_eq!(hex.len(), 48);
        assert_eq!(Bitmap::from_hex(130, &hex).expect("decode"), bitmap);
        assert!(Bitmap::from_hex(130, "00").is_err());
    }

    #[test]
    fn first_clear_skips_full_words() {
        let mut bitmap = Bitmap::new(200);
        for i in 0..70 {
            bitmap.set(i, true);
        }
        assert_eq!(bitmap.first_clear(200), Some(70));
        assert_eq!(bitmap.first_clear(70), None);
    }

    #[test]
    fn newer_entry_version_is_refused() {
        let entry = SubnetEntry {
            version: 2,
            size: 256,
            bitmap: "0".repeat(64),
        };
        assert!(entry.decode("10.0.0.0/24").is_err());
    }
}
