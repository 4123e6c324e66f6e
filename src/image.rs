use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use tracing::debug;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use crate::config::ImageConfig;
use crate::error::{KvspError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Rom,
    Ram,
}

impl ImageKind {
    pub fn name(self) -> &'static str {
        match self {
            ImageKind::Rom => "ROM",
            ImageKind::Ram => "RAM",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-length, zero-initialised instruction or data memory.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryImage {
    kind: ImageKind,
    bytes: Vec<u8>,
}

impl MemoryImage {
    pub fn new(kind: ImageKind, len: usize) -> Self {
        Self {
            kind,
            bytes: vec![0; len],
        }
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Copies `data` to `offset`, refusing anything that would run past the end.
    pub fn load(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let out_of_bounds = || KvspError::OutOfBounds {
            image: self.kind.name(),
            offset,
            length: data.len() as u64,
            capacity: self.bytes.len(),
        };

        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(out_of_bounds)?;

        self.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl Deref for MemoryImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for MemoryImage {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryImage")
            .field("kind", &self.kind)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A loadable piece of an executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSegment<'a> {
    pub vaddr: u64,
    pub data: &'a [u8],
}

/// Instruction and data memory of one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImages {
    pub rom: MemoryImage,
    pub ram: MemoryImage,
}

impl ProgramImages {
    /// Places every non-empty segment into ROM or RAM according to `config.boundary`.
    pub fn from_segments<'a, I>(segments: I, config: &ImageConfig) -> Result<Self>
    where
        I: IntoIterator<Item = ProgramSegment<'a>>,
    {
        let mut rom = MemoryImage::new(ImageKind::Rom, config.rom_size);
        let mut ram = MemoryImage::new(ImageKind::Ram, config.ram_size);

        for segment in segments {
            if segment.data.is_empty() {
                continue;
            }

            let (target, offset) = if segment.vaddr < config.boundary {
                (&mut rom, segment.vaddr)
            } else {
                (&mut ram, segment.vaddr - config.boundary)
            };
            debug!(
                "loading {} bytes at {:#x} into {} offset {:#x}",
                segment.data.len(),
                segment.vaddr,
                target.kind(),
                offset
            );
            target.load(offset, segment.data)?;
        }

        Ok(Self { rom, ram })
    }

    /// Extracts the images from an in-memory ELF executable.
    pub fn from_elf(input: &[u8], config: &ImageConfig) -> Result<Self> {
        Self::from_segments(elf_segments(input)?, config)
    }

    pub fn from_elf_file<P: AsRef<Path>>(path: P, config: &ImageConfig) -> Result<Self> {
        let input = std::fs::read(path)?;
        Self::from_elf(&input, config)
    }
}

/// Collects the file-backed bytes of every `PT_LOAD` header.
pub fn elf_segments(input: &[u8]) -> Result<Vec<ProgramSegment<'_>>> {
    let elf = ElfFile::new(input).map_err(KvspError::Elf)?;

    // xmas-elf slices the header table without checking it against the input.
    let table_end = usize::try_from(elf.header.pt2.ph_offset())
        .ok()
        .and_then(|offset| {
            let entries = usize::from(elf.header.pt2.ph_count());
            let entry_size = usize::from(elf.header.pt2.ph_entry_size());
            offset.checked_add(entries.checked_mul(entry_size)?)
        });
    if table_end.map_or(true, |end| end > input.len()) {
        return Err(KvspError::Elf("program headers extend past end of file"));
    }

    let mut segments = Vec::new();
    for header in elf.program_iter() {
        if header.get_type().map_err(KvspError::Elf)? != Type::Load {
            continue;
        }

        let start = usize::try_from(header.offset())
            .map_err(|_| KvspError::Elf("segment offset out of range"))?;
        let size = usize::try_from(header.file_size())
            .map_err(|_| KvspError::Elf("segment size out of range"))?;
        let data = start
            .checked_add(size)
            .and_then(|end| input.get(start..end))
            .ok_or(KvspError::Elf("segment extends past end of file"))?;

        segments.push(ProgramSegment {
            vaddr: header.virtual_addr(),
            data,
        });
    }

    Ok(segments)
}
