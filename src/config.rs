use crate::error::{KvspError, Result};
use crate::plane;

/// Virtual address at which the data address space starts.
pub const DEFAULT_BOUNDARY: u64 = 0x10000;
pub const DEFAULT_ROM_SIZE: usize = 512;
pub const DEFAULT_RAM_SIZE: usize = 512;

/// How the RAM image travels to and from the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamPlanes {
    /// One contiguous image.
    Single,
    /// Two half-length byte lanes, odd offsets first.
    Dual,
}

/// Shape of the address space for one protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConfig {
    pub rom_size: usize,
    pub ram_size: usize,
    pub boundary: u64,
    pub ram_planes: RamPlanes,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            rom_size: DEFAULT_ROM_SIZE,
            ram_size: DEFAULT_RAM_SIZE,
            boundary: DEFAULT_BOUNDARY,
            ram_planes: RamPlanes::Single,
        }
    }
}

impl ImageConfig {
    /// Layout used by evaluators that model RAM as two parallel byte lanes.
    pub fn dual_plane(ram_size: usize) -> Self {
        Self {
            ram_size,
            ram_planes: RamPlanes::Dual,
            ..Self::default()
        }
    }

    /// Turns a RAM image into the byte sequence placed in a packet.
    pub fn pack_ram(&self, ram: &[u8]) -> Result<Vec<u8>> {
        match self.ram_planes {
            RamPlanes::Single => Ok(ram.to_vec()),
            RamPlanes::Dual => {
                let (a, b) = plane::split(ram)?;
                Ok([a, b].concat())
            }
        }
    }

    /// Inverse of [`ImageConfig::pack_ram`].
    pub fn unpack_ram(&self, packed: &[u8]) -> Result<Vec<u8>> {
        match self.ram_planes {
            RamPlanes::Single => Ok(packed.to_vec()),
            RamPlanes::Dual => {
                if packed.len() % 2 != 0 {
                    return Err(KvspError::UnevenImage(packed.len()));
                }
                let (a, b) = packed.split_at(packed.len() / 2);
                plane::merge(a, b)
            }
        }
    }
}

/// Per-invocation settings handed to the collaborator layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    pub verbose: bool,
    /// Worker threads passed to the circuit evaluator.
    pub threads: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            + 1;
        Self {
            verbose: false,
            threads,
        }
    }
}
