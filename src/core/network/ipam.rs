use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use bitvec::prelude::*;
use ipnet::Ipv4Net;
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::core::{
    error::{NetError, Result},
    store,
};

/// Subnets wider than this are refused; the bitmap is one byte per address on disk.
pub const MIN_PREFIX_LEN: u8 = 8;

type Bitmap = BitVec<u8, Msb0>;

/// The persisted allocation table: canonical CIDR to one bit per address.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct SubnetTable {
    #[serde(serialize_with = "serialize_subnets")]
    #[serde(deserialize_with = "deserialize_subnets")]
    subnets: BTreeMap<String, Bitmap>,
}

impl SubnetTable {
    pub fn bitmap(&self, subnet: &Ipv4Net) -> Option<String> {
        self.subnets.get(&subnet.trunc().to_string()).map(to_bitstring)
    }

    fn allocate(&mut self, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
        let usable = usable_hosts(subnet);
        let bitmap = self
            .subnets
            .entry(subnet.to_string())
            .or_insert_with(|| bitvec![u8, Msb0; 0; total_hosts(subnet)]);

        match bitmap.first_zero().filter(|pos| *pos < usable) {
            Some(pos) => {
                bitmap.set(pos, true);
                Ok(index_to_ip(subnet, pos))
            }
            None => Err(NetError::Exhausted {
                subnet: subnet.to_string(),
            }),
        }
    }

    fn release(&mut self, subnet: &Ipv4Net, ip: Ipv4Addr) -> Result<()> {
        let pos = ip_to_index(subnet, ip)?;
        let key = subnet.to_string();

        if let Some(bitmap) = self.subnets.get_mut(&key) {
            if pos < bitmap.len() {
                bitmap.set(pos, false);
            }
            if bitmap.not_any() {
                self.subnets.remove(&key);
            }
        }

        Ok(())
    }
}

/// Bit-per-address allocator backed by a single JSON file.
///
/// Nothing is cached between calls: each allocation or release loads the
/// whole table under an exclusive file lock and writes it back before the
/// lock is dropped, so concurrent `rtain` processes never hand out the same
/// address twice.
#[derive(Debug, Clone)]
pub struct Ipam {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Ipam {
    pub fn new(path: impl AsRef<Path>, lock_path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock_path: lock_path.as_ref().to_path_buf(),
        }
    }

    /// Hand out the lowest free address of `subnet`. Bit 0 maps to `base + 1`,
    /// which makes the first allocation of a subnet its gateway.
    pub fn allocate(&self, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
        let subnet = canonical(subnet)?;

        let _lock = store::lock_exclusive(&self.lock_path)?;
        let mut table = self.load()?;

        let ip = table.allocate(&subnet).inspect_err(|e| {
            error!("Failed to allocate from {subnet}: {e}");
        })?;
        self.save(&table)?;

        debug!("Allocated {ip} from {subnet}");
        Ok(ip)
    }

    /// Return `ip` to `subnet`. Releasing a free address still rewrites the table.
    pub fn release(&self, subnet: &Ipv4Net, ip: Ipv4Addr) -> Result<()> {
        let subnet = canonical(subnet)?;

        let _lock = store::lock_exclusive(&self.lock_path)?;
        let mut table = self.load()?;

        table.release(&subnet, ip)?;
        self.save(&table)?;

        debug!("Released {ip} to {subnet}");
        Ok(())
    }

    pub fn load(&self) -> Result<SubnetTable> {
        Ok(store::read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, table: &SubnetTable) -> Result<()> {
        store::write_json(&self.path, table)
    }
}

fn canonical(subnet: &Ipv4Net) -> Result<Ipv4Net> {
    if subnet.prefix_len() < MIN_PREFIX_LEN {
        return Err(NetError::invalid(format!(
            "subnet {subnet} is too large, prefix must be at least /{MIN_PREFIX_LEN}"
        )));
    }

    Ok(subnet.trunc())
}

fn total_hosts(subnet: &Ipv4Net) -> usize {
    1usize << (32 - subnet.prefix_len())
}

/// Network and broadcast addresses are never handed out.
fn usable_hosts(subnet: &Ipv4Net) -> usize {
    total_hosts(subnet).saturating_sub(2)
}

fn index_to_ip(subnet: &Ipv4Net, index: usize) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + index as u32 + 1)
}

fn ip_to_index(subnet: &Ipv4Net, ip: Ipv4Addr) -> Result<usize> {
    if !subnet.contains(&ip) {
        return Err(NetError::invalid(format!("{ip} is not in subnet {subnet}")));
    }

    let offset = (u32::from(ip) - u32::from(subnet.network())) as usize;
    if offset == 0 || offset > usable_hosts(subnet) {
        return Err(NetError::invalid(format!(
            "{ip} is not an allocatable address of {subnet}"
        )));
    }

    Ok(offset - 1)
}

fn to_bitstring(bitmap: &Bitmap) -> String {
    bitmap.iter().map(|bit| if *bit { '1' } else { '0' }).collect()
}

fn serialize_subnets<S>(
    subnets: &BTreeMap<String, Bitmap>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let map: BTreeMap<&String, String> = subnets
        .iter()
        .map(|(cidr, bitmap)| (cidr, to_bitstring(bitmap)))
        .collect();
    map.serialize(serializer)
}

fn deserialize_subnets<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Bitmap>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let map: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
    let mut subnets = BTreeMap::new();
    for (cidr, bits) in map {
        let mut bitmap = Bitmap::with_capacity(bits.len());
        for c in bits.chars() {
            match c {
                '0' => bitmap.push(false),
                '1' => bitmap.push(true),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "invalid bit {other:?} in bitmap of {cidr}"
                    )))
                }
            }
        }
        subnets.insert(cidr, bitmap);
    }
    Ok(subnets)
}
