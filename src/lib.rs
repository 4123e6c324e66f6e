//! Preparation and interpretation of Virtual Secure Platform program images.
//!
//! An executable is cut into ROM and RAM images ([`image`]), its command
//! line is laid out in RAM ([`startup`]), the images are wrapped in KVSP
//! packets ([`packet`]) for the encryption and evaluation tools ([`tools`]),
//! and what comes back is decoded into a [`result::PlainResult`].

pub mod config;
pub mod error;
pub mod image;
pub mod packet;
pub mod plane;
pub mod result;
pub mod startup;
pub mod tools;

pub use config::{ImageConfig, RamPlanes, RunConfig};
pub use error::KvspError;
pub use image::{MemoryImage, ProgramImages, ProgramSegment};
pub use packet::{Packet, PacketFormat};
pub use result::PlainResult;

/// Extracts the images of `elf` and attaches `args` as its command line.
pub fn prepare_images<S: AsRef<str>>(
    elf: &[u8],
    args: &[S],
    config: &ImageConfig,
) -> error::Result<ProgramImages> {
    let mut images = ProgramImages::from_elf(elf, config)?;
    startup::attach(&mut images.ram, args)?;
    Ok(images)
}
