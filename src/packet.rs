//! KVSP packet containers exchanged with the encryption and evaluation tools.
//!
//! Every packet starts with the ASCII signature `KVSP` and a `u32` version,
//! followed by format specific size fields. All integers are little-endian,
//! there is no padding, and every size field equals the byte length of the
//! section it describes.
//!
//! | format          | header fields after signature + version          |
//! |-----------------|--------------------------------------------------|
//! | request         | `u64` key, `u64` rom, `u64` ram                  |
//! | plain request   | `u64` rom, `u64` ram                             |
//! | response        | `u16` nflags, `u16` nregs, `u64` flags, `u64` regs, `u64` ram |
//! | plain response  | same as response                                 |

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{KvspError, Result};

pub const SIGNATURE: &[u8; 4] = b"KVSP";
pub const VERSION: u32 = 0;

const PREAMBLE_LEN: usize = 8;
const REQUEST_FIELDS_LEN: usize = 24;
const PLAIN_REQUEST_FIELDS_LEN: usize = 16;
const RESPONSE_FIELDS_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    Request,
    PlainRequest,
    Response,
    PlainResponse,
}

impl PacketFormat {
    /// Total header length, signature and version included.
    pub fn header_len(self) -> usize {
        PREAMBLE_LEN + self.fields_len()
    }

    fn fields_len(self) -> usize {
        match self {
            PacketFormat::Request => REQUEST_FIELDS_LEN,
            PacketFormat::PlainRequest => PLAIN_REQUEST_FIELDS_LEN,
            PacketFormat::Response | PacketFormat::PlainResponse => RESPONSE_FIELDS_LEN,
        }
    }
}

/// Encrypted program: cloud key plus encrypted ROM and RAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cloud_key: Vec<u8>,
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainRequest {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
}

/// Encrypted evaluation result. Each flag and register is an opaque
/// ciphertext block; all blocks of one kind share the same width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub flags: Vec<Vec<u8>>,
    pub regs: Vec<Vec<u8>>,
    pub ram: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainResponse {
    pub flags: Vec<bool>,
    pub regs: Vec<u16>,
    pub ram: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(Request),
    PlainRequest(PlainRequest),
    Response(Response),
    PlainResponse(PlainResponse),
}

impl From<Request> for Packet {
    fn from(p: Request) -> Self {
        Packet::Request(p)
    }
}

impl From<PlainRequest> for Packet {
    fn from(p: PlainRequest) -> Self {
        Packet::PlainRequest(p)
    }
}

impl From<Response> for Packet {
    fn from(p: Response) -> Self {
        Packet::Response(p)
    }
}

impl From<PlainResponse> for Packet {
    fn from(p: PlainResponse) -> Self {
        Packet::PlainResponse(p)
    }
}

/// Size fields shared by both response formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResponseHeader {
    nflags: u16,
    nregs: u16,
    flags_size: u64,
    regs_size: u64,
    ram_size: u64,
}

impl ResponseHeader {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.nflags);
        buf.put_u16_le(self.nregs);
        buf.put_u64_le(self.flags_size);
        buf.put_u64_le(self.regs_size);
        buf.put_u64_le(self.ram_size);
    }

    fn get(mut buf: &[u8]) -> Self {
        Self {
            nflags: buf.get_u16_le(),
            nregs: buf.get_u16_le(),
            flags_size: buf.get_u64_le(),
            regs_size: buf.get_u64_le(),
            ram_size: buf.get_u64_le(),
        }
    }

    /// Width of each block in a section of `count` equally sized elements.
    fn block_width(section: &'static str, count: u16, size: u64) -> Result<u64> {
        if count == 0 {
            return if size == 0 {
                Ok(0)
            } else {
                Err(KvspError::Format(format!(
                    "{section} section holds {size} bytes but no elements"
                )))
            };
        }
        if size % u64::from(count) != 0 {
            return Err(KvspError::Format(format!(
                "{section} section of {size} bytes does not divide into {count} blocks"
            )));
        }
        Ok(size / u64::from(count))
    }
}

impl Packet {
    pub fn format(&self) -> PacketFormat {
        match self {
            Packet::Request(_) => PacketFormat::Request,
            Packet::PlainRequest(_) => PacketFormat::PlainRequest,
            Packet::Response(_) => PacketFormat::Response,
            Packet::PlainResponse(_) => PacketFormat::PlainResponse,
        }
    }

    /// Serializes the whole packet, header first.
    pub fn to_bytes(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(self.format().header_len());
        buf.put_slice(SIGNATURE);
        buf.put_u32_le(VERSION);

        match self {
            Packet::Request(p) => {
                buf.put_u64_le(p.cloud_key.len() as u64);
                buf.put_u64_le(p.rom.len() as u64);
                buf.put_u64_le(p.ram.len() as u64);
                buf.put_slice(&p.cloud_key);
                buf.put_slice(&p.rom);
                buf.put_slice(&p.ram);
            }
            Packet::PlainRequest(p) => {
                buf.put_u64_le(p.rom.len() as u64);
                buf.put_u64_le(p.ram.len() as u64);
                buf.put_slice(&p.rom);
                buf.put_slice(&p.ram);
            }
            Packet::Response(p) => {
                let header = ResponseHeader {
                    nflags: count("flags", p.flags.len())?,
                    nregs: count("registers", p.regs.len())?,
                    flags_size: uniform_size("flags", &p.flags)?,
                    regs_size: uniform_size("registers", &p.regs)?,
                    ram_size: p.ram.len() as u64,
                };
                header.put(&mut buf);
                p.flags.iter().for_each(|block| buf.put_slice(block));
                p.regs.iter().for_each(|block| buf.put_slice(block));
                buf.put_slice(&p.ram);
            }
            Packet::PlainResponse(p) => {
                let header = ResponseHeader {
                    nflags: count("flags", p.flags.len())?,
                    nregs: count("registers", p.regs.len())?,
                    flags_size: p.flags.len() as u64,
                    regs_size: p.regs.len() as u64 * 2,
                    ram_size: p.ram.len() as u64,
                };
                header.put(&mut buf);
                p.flags.iter().for_each(|&flag| buf.put_u8(flag as u8));
                p.regs.iter().for_each(|&reg| buf.put_u16_le(reg));
                buf.put_slice(&p.ram);
            }
        }

        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads one packet of the given format.
    ///
    /// The signature and version are checked before anything past them is
    /// read. Any section shorter than its declared length is an error.
    pub fn read_from<R: Read>(mut reader: R, format: PacketFormat) -> Result<Self> {
        let preamble = read_section(&mut reader, "header", PREAMBLE_LEN as u64)?;
        let (signature, mut version) = preamble.split_at(SIGNATURE.len());
        if signature != SIGNATURE {
            return Err(KvspError::Format(format!(
                "bad signature {:02x?}, expected {:02x?}",
                signature, SIGNATURE
            )));
        }
        let version = version.get_u32_le();
        if version != VERSION {
            return Err(KvspError::Format(format!(
                "unsupported version {version}, expected {VERSION}"
            )));
        }

        let fields = read_section(&mut reader, "header", format.fields_len() as u64)?;
        let mut fields = &fields[..];

        let packet = match format {
            PacketFormat::Request => {
                let key_size = fields.get_u64_le();
                let rom_size = fields.get_u64_le();
                let ram_size = fields.get_u64_le();
                Packet::Request(Request {
                    cloud_key: read_section(&mut reader, "cloud key", key_size)?,
                    rom: read_section(&mut reader, "ROM", rom_size)?,
                    ram: read_section(&mut reader, "RAM", ram_size)?,
                })
            }
            PacketFormat::PlainRequest => {
                let rom_size = fields.get_u64_le();
                let ram_size = fields.get_u64_le();
                Packet::PlainRequest(PlainRequest {
                    rom: read_section(&mut reader, "ROM", rom_size)?,
                    ram: read_section(&mut reader, "RAM", ram_size)?,
                })
            }
            PacketFormat::Response => {
                let header = ResponseHeader::get(fields);
                let flag_width =
                    ResponseHeader::block_width("flags", header.nflags, header.flags_size)?;
                let reg_width =
                    ResponseHeader::block_width("registers", header.nregs, header.regs_size)?;

                let flags = (0..header.nflags)
                    .map(|_| read_section(&mut reader, "flags", flag_width))
                    .collect::<Result<_>>()?;
                let regs = (0..header.nregs)
                    .map(|_| read_section(&mut reader, "registers", reg_width))
                    .collect::<Result<_>>()?;
                Packet::Response(Response {
                    flags,
                    regs,
                    ram: read_section(&mut reader, "RAM", header.ram_size)?,
                })
            }
            PacketFormat::PlainResponse => {
                let header = ResponseHeader::get(fields);
                if header.flags_size != u64::from(header.nflags) {
                    return Err(KvspError::Format(format!(
                        "{} plain flags need {} bytes, header declares {}",
                        header.nflags, header.nflags, header.flags_size
                    )));
                }
                if header.regs_size != u64::from(header.nregs) * 2 {
                    return Err(KvspError::Format(format!(
                        "{} plain registers need {} bytes, header declares {}",
                        header.nregs,
                        u64::from(header.nregs) * 2,
                        header.regs_size
                    )));
                }

                let flags = read_section(&mut reader, "flags", header.flags_size)?;
                let regs = read_section(&mut reader, "registers", header.regs_size)?;
                Packet::PlainResponse(PlainResponse {
                    flags: flags.iter().map(|&b| b != 0).collect(),
                    regs: regs
                        .chunks_exact(2)
                        .map(|word| u16::from_le_bytes([word[0], word[1]]))
                        .collect(),
                    ram: read_section(&mut reader, "RAM", header.ram_size)?,
                })
            }
        };

        Ok(packet)
    }
}

fn count(section: &'static str, len: usize) -> Result<u16> {
    u16::try_from(len)
        .map_err(|_| KvspError::Format(format!("too many {section}: {len}")))
}

fn uniform_size(section: &'static str, blocks: &[Vec<u8>]) -> Result<u64> {
    let width = blocks.first().map_or(0, Vec::len);
    if let Some(odd) = blocks.iter().find(|block| block.len() != width) {
        return Err(KvspError::Format(format!(
            "{section} blocks differ in width ({width} vs {} bytes)",
            odd.len()
        )));
    }
    Ok((width * blocks.len()) as u64)
}

/// Reads exactly `len` bytes, reporting a short read as truncation.
fn read_section<R: Read>(reader: &mut R, section: &'static str, len: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(KvspError::TruncatedData {
            section,
            expected: len,
            actual: buf.len() as u64,
        });
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) -> Packet {
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"KVSP");
        Packet::read_from(&bytes[..], packet.format()).unwrap()
    }

    #[test]
    fn request_layout() {
        let packet = Packet::from(Request {
            cloud_key: vec![0xAA; 3],
            rom: vec![1, 2],
            ram: vec![3],
        });
        let bytes = packet.to_bytes().unwrap();

        assert_eq!(bytes.len(), 32 + 3 + 2 + 1);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &2u64.to_le_bytes());
        assert_eq!(&bytes[24..32], &1u64.to_le_bytes());
        assert_eq!(&bytes[32..], &[0xAA, 0xAA, 0xAA, 1, 2, 3]);
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn plain_request_round_trip() {
        let packet = Packet::from(PlainRequest {
            rom: (0..=255).collect(),
            ram: vec![7; 512],
        });
        assert_eq!(packet.to_bytes().unwrap().len(), 24 + 256 + 512);
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn response_counts_and_blocks() {
        let packet = Packet::from(Response {
            flags: vec![vec![0x01]],
            regs: vec![vec![0x34, 0x12], vec![0x78, 0x56]],
            ram: vec![9, 8, 7, 6],
        });
        let bytes = packet.to_bytes().unwrap();

        assert_eq!(&bytes[8..10], &1u16.to_le_bytes());
        assert_eq!(&bytes[10..12], &2u16.to_le_bytes());
        assert_eq!(&bytes[12..20], &1u64.to_le_bytes());
        assert_eq!(&bytes[20..28], &4u64.to_le_bytes());
        assert_eq!(&bytes[28..36], &4u64.to_le_bytes());
        assert_eq!(&bytes[36..], &[0x01, 0x34, 0x12, 0x78, 0x56, 9, 8, 7, 6]);
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn plain_response_round_trip() {
        let packet = Packet::from(PlainResponse {
            flags: vec![true, false],
            regs: (0..16).map(|i| i * 0x1111).collect(),
            ram: vec![0xEE; 16],
        });
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn plain_response_treats_nonzero_as_true() {
        let mut bytes = Packet::from(PlainResponse {
            flags: vec![false],
            regs: vec![],
            ram: vec![],
        })
        .to_bytes()
        .unwrap();
        bytes[36] = 0x80;

        match Packet::read_from(&bytes[..], PacketFormat::PlainResponse).unwrap() {
            Packet::PlainResponse(p) => assert_eq!(p.flags, vec![true]),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut bytes = Packet::from(PlainRequest {
            rom: vec![],
            ram: vec![],
        })
        .to_bytes()
        .unwrap();
        bytes[0] = b'X';

        assert!(matches!(
            Packet::read_from(&bytes[..], PacketFormat::PlainRequest),
            Err(KvspError::Format(_))
        ));
    }

    #[test]
    fn future_version_is_rejected_before_fields() {
        // Only the preamble is present; a version mismatch must win over truncation.
        let mut bytes = b"KVSP".to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());

        assert!(matches!(
            Packet::read_from(&bytes[..], PacketFormat::Request),
            Err(KvspError::Format(msg)) if msg.contains("version 1")
        ));
    }

    #[test]
    fn short_section_is_truncation() {
        let bytes = Packet::from(PlainRequest {
            rom: vec![1; 8],
            ram: vec![2; 8],
        })
        .to_bytes()
        .unwrap();
        let short = &bytes[..bytes.len() - 3];

        match Packet::read_from(short, PacketFormat::PlainRequest) {
            Err(KvspError::TruncatedData {
                section,
                expected,
                actual,
            }) => {
                assert_eq!(section, "RAM");
                assert_eq!(expected, 8);
                assert_eq!(actual, 5);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn short_header_is_truncation() {
        assert!(matches!(
            Packet::read_from(&b"KVSP\0\0\0\0\x01"[..], PacketFormat::PlainRequest),
            Err(KvspError::TruncatedData {
                section: "header",
                ..
            })
        ));
    }

    #[test]
    fn uneven_blocks_cannot_be_written() {
        let packet = Packet::from(Response {
            flags: vec![vec![1], vec![1, 2]],
            regs: vec![],
            ram: vec![],
        });
        assert!(matches!(packet.to_bytes(), Err(KvspError::Format(_))));
    }

    #[test]
    fn indivisible_block_section_is_rejected() {
        let mut bytes = Packet::from(Response {
            flags: vec![vec![1, 1], vec![2, 2]],
            regs: vec![],
            ram: vec![],
        })
        .to_bytes()
        .unwrap();
        // flags_size = 3 for two blocks
        bytes[12..20].copy_from_slice(&3u64.to_le_bytes());

        assert!(matches!(
            Packet::read_from(&bytes[..], PacketFormat::Response),
            Err(KvspError::Format(_))
        ));
    }

    #[test]
    fn bytes_without_elements_are_rejected() {
        let mut bytes = Packet::from(Response {
            flags: vec![],
            regs: vec![vec![0, 0]],
            ram: vec![],
        })
        .to_bytes()
        .unwrap();
        bytes[12..20].copy_from_slice(&4u64.to_le_bytes());

        assert!(matches!(
            Packet::read_from(&bytes[..], PacketFormat::Response),
            Err(KvspError::Format(msg)) if msg.contains("no elements")
        ));
    }

    #[test]
    fn plain_section_sizes_must_match_counts() {
        let bytes = Packet::from(PlainResponse {
            flags: vec![true, false],
            regs: vec![1, 2, 3],
            ram: vec![],
        })
        .to_bytes()
        .unwrap();

        let mut wide_flags = bytes.clone();
        wide_flags[12..20].copy_from_slice(&4u64.to_le_bytes());
        assert!(matches!(
            Packet::read_from(&wide_flags[..], PacketFormat::PlainResponse),
            Err(KvspError::Format(msg)) if msg.contains("plain flags")
        ));

        let mut narrow_regs = bytes;
        narrow_regs[20..28].copy_from_slice(&3u64.to_le_bytes());
        assert!(matches!(
            Packet::read_from(&narrow_regs[..], PacketFormat::PlainResponse),
            Err(KvspError::Format(msg)) if msg.contains("plain registers")
        ));
    }
}
