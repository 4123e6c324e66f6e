//! Decoded evaluation results and their renderers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KvspError, Result};
use crate::packet::PlainResponse;
use crate::plane::{self, PLANE_A, PLANE_B};

pub const FINISH_FLAG: &str = "finflag";
pub const RAM_ENTRY: &str = "ram";
pub const NUM_REGISTERS: usize = 16;

/// Cycle count of results that did not come with one.
pub const UNKNOWN_CYCLES: i64 = -1;

pub fn register_name(index: usize) -> String {
    format!("reg_x{index}")
}

/// Evaluator output as written by the plain-mode circuit runner.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultDocument {
    pub cycles: i64,
    #[serde(default)]
    pub bits: Vec<Entry>,
    #[serde(default)]
    pub ram: Vec<Entry>,
}

/// A named run of bytes. For bit entries `size` counts bits and `bytes`
/// holds them little-endian; for memory entries `size` counts bytes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    pub bytes: Vec<u8>,
}

impl Entry {
    fn schema_error(&self, reason: String) -> KvspError {
        KvspError::Schema {
            name: self.name.clone(),
            reason,
        }
    }

    fn expect_len(&self, len: u64) -> Result<()> {
        if self.bytes.len() as u64 != len {
            return Err(self.schema_error(format!(
                "expected {len} bytes, found {}",
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlainResult {
    pub cycles: i64,
    pub flags: BTreeMap<String, bool>,
    pub registers: BTreeMap<String, u16>,
    pub ram: Vec<u8>,
}

impl PlainResult {
    /// Builds and validates a result from a parsed document.
    ///
    /// `ram_size`, when given, is the expected length of the merged memory.
    pub fn from_document(doc: ResultDocument, ram_size: Option<usize>) -> Result<Self> {
        let mut flags = BTreeMap::new();
        let mut registers = BTreeMap::new();

        reject_duplicates(&doc.bits)?;
        for entry in &doc.bits {
            match entry.size {
                1 => {
                    entry.expect_len(1)?;
                    flags.insert(entry.name.clone(), entry.bytes[0] & 1 != 0);
                }
                16 => {
                    entry.expect_len(2)?;
                    let value = u16::from_le_bytes([entry.bytes[0], entry.bytes[1]]);
                    registers.insert(entry.name.clone(), value);
                }
                other => {
                    return Err(entry.schema_error(format!("unsupported bit width {other}")));
                }
            }
        }

        for entry in &doc.ram {
            entry.expect_len(entry.size)?;
        }
        let ram = merge_memory(&doc.ram)?;

        let result = Self {
            cycles: doc.cycles,
            flags,
            registers,
            ram,
        };
        result.validate(ram_size)?;
        Ok(result)
    }

    pub fn from_json(input: &str, ram_size: Option<usize>) -> Result<Self> {
        let doc: ResultDocument = serde_json::from_str(input)?;
        Self::from_document(doc, ram_size)
    }

    /// Names positional flags and registers: flag 0 is the finish flag,
    /// register `i` is `reg_x{i}`.
    pub fn from_values(cycles: i64, flags: &[bool], regs: &[u16], ram: Vec<u8>) -> Result<Self> {
        let flags = flags
            .iter()
            .enumerate()
            .map(|(i, &flag)| {
                let name = if i == 0 {
                    FINISH_FLAG.to_owned()
                } else {
                    format!("flag{i}")
                };
                (name, flag)
            })
            .collect();
        let registers = regs
            .iter()
            .enumerate()
            .map(|(i, &reg)| (register_name(i), reg))
            .collect();

        let result = Self {
            cycles,
            flags,
            registers,
            ram,
        };
        result.validate(None)?;
        Ok(result)
    }

    pub fn from_plain_response(packet: &PlainResponse) -> Result<Self> {
        Self::from_values(
            UNKNOWN_CYCLES,
            &packet.flags,
            &packet.regs,
            packet.ram.clone(),
        )
    }

    pub fn finished(&self) -> bool {
        self.flags.get(FINISH_FLAG).copied().unwrap_or(false)
    }

    /// Register `x{index}`.
    pub fn register(&self, index: usize) -> Option<u16> {
        self.registers.get(&register_name(index)).copied()
    }

    fn validate(&self, ram_size: Option<usize>) -> Result<()> {
        if !self.flags.contains_key(FINISH_FLAG) {
            return Err(KvspError::missing(FINISH_FLAG));
        }

        for index in 0..NUM_REGISTERS {
            let name = register_name(index);
            if !self.registers.contains_key(&name) {
                return Err(KvspError::missing(name));
            }
        }
        if let Some(extra) = self
            .registers
            .keys()
            .find(|name| !is_register_name(name))
        {
            return Err(KvspError::Validation {
                name: extra.clone(),
                reason: "unknown register",
            });
        }

        if let Some(expected) = ram_size {
            if self.ram.len() != expected {
                return Err(KvspError::Schema {
                    name: RAM_ENTRY.to_owned(),
                    reason: format!("expected {expected} bytes, found {}", self.ram.len()),
                });
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn is_register_name(name: &str) -> bool {
    name.strip_prefix("reg_x")
        .and_then(|index| index.parse::<usize>().ok())
        .map_or(false, |index| {
            index < NUM_REGISTERS && register_name(index) == name
        })
}

fn reject_duplicates(entries: &[Entry]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for entry in entries {
        if !seen.insert(entry.name.as_str()) {
            return Err(entry.schema_error("duplicate entry".to_owned()));
        }
    }
    Ok(())
}

fn merge_memory(entries: &[Entry]) -> Result<Vec<u8>> {
    reject_duplicates(entries)?;
    let find = |name: &str| entries.iter().find(|entry| entry.name == name);

    if let Some(unknown) = entries
        .iter()
        .find(|entry| ![RAM_ENTRY, PLANE_A, PLANE_B].contains(&entry.name.as_str()))
    {
        return Err(unknown.schema_error("unknown memory block".to_owned()));
    }

    match (find(RAM_ENTRY), find(PLANE_A), find(PLANE_B)) {
        (Some(ram), None, None) => Ok(ram.bytes.clone()),
        (None, Some(a), Some(b)) => plane::merge(&a.bytes, &b.bytes),
        (None, Some(_), None) => Err(KvspError::missing(PLANE_B)),
        (None, None, Some(_)) => Err(KvspError::missing(PLANE_A)),
        (None, None, None) => Err(KvspError::missing(RAM_ENTRY)),
        (Some(_), _, _) => Err(KvspError::Schema {
            name: RAM_ENTRY.to_owned(),
            reason: "both a flat image and planes are present".to_owned(),
        }),
    }
}

impl fmt::Display for PlainResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cycles >= 0 {
            writeln!(f, "#cycle\t{}", self.cycles)?;
        }
        writeln!(f, "#{}\t{}", FINISH_FLAG, self.finished())?;
        for index in 0..NUM_REGISTERS {
            writeln!(f, "x{}\t{}", index, self.register(index).unwrap_or(0))?;
        }
        writeln!(f)?;
        write!(f, "{}", HexDump(&self.ram))
    }
}

/// Sixteen bytes per line, each line prefixed with its offset.
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (line, chunk) in self.0.chunks(16).enumerate() {
            write!(f, "{:04x}:", line * 16)?;
            for byte in chunk {
                write!(f, " {byte:02x}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registers() -> Vec<serde_json::Value> {
        (0..16)
            .map(|i| json!({ "name": register_name(i), "size": 16, "bytes": [i, 0] }))
            .collect()
    }

    fn document(extra_bits: Vec<serde_json::Value>, ram: serde_json::Value) -> String {
        let mut bits = registers();
        bits.extend(extra_bits);
        json!({ "cycles": 42, "bits": bits, "ram": ram }).to_string()
    }

    fn finflag(value: u8) -> serde_json::Value {
        json!({ "name": "finflag", "size": 1, "bytes": [value] })
    }

    #[test]
    fn decodes_flat_ram() {
        let input = document(
            vec![finflag(1)],
            json!([{ "name": "ram", "size": 4, "bytes": [1, 2, 3, 4] }]),
        );
        let result = PlainResult::from_json(&input, Some(4)).unwrap();

        assert_eq!(result.cycles, 42);
        assert!(result.finished());
        assert_eq!(result.register(7), Some(7));
        assert_eq!(result.ram, vec![1, 2, 3, 4]);
    }

    #[test]
    fn merges_planes() {
        let input = document(
            vec![finflag(0)],
            json!([
                { "name": "ramA", "size": 2, "bytes": [0x11, 0x33] },
                { "name": "ramB", "size": 2, "bytes": [0x00, 0x22] },
            ]),
        );
        let result = PlainResult::from_json(&input, None).unwrap();

        assert!(!result.finished());
        assert_eq!(result.ram, vec![0x00, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn missing_finflag_is_named() {
        let input = document(vec![], json!([{ "name": "ram", "size": 0, "bytes": [] }]));
        let err = PlainResult::from_json(&input, None).unwrap_err();

        match err {
            KvspError::Validation { name, .. } => assert_eq!(name, "finflag"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_register_is_named() {
        let mut doc: ResultDocument = serde_json::from_str(&document(
            vec![finflag(1)],
            json!([{ "name": "ram", "size": 0, "bytes": [] }]),
        ))
        .unwrap();
        doc.bits.retain(|entry| entry.name != "reg_x15");

        assert!(matches!(
            PlainResult::from_document(doc, None),
            Err(KvspError::Validation { name, .. }) if name == "reg_x15"
        ));
    }

    #[test]
    fn byte_wide_bit_entry_is_a_schema_error() {
        let input = document(
            vec![
                finflag(1),
                json!({ "name": "status", "size": 8, "bytes": [0] }),
            ],
            json!([{ "name": "ram", "size": 0, "bytes": [] }]),
        );
        let err = PlainResult::from_json(&input, None).unwrap_err();

        assert!(matches!(err, KvspError::Schema { name, .. } if name == "status"));
    }

    #[test]
    fn unknown_register_is_rejected() {
        let input = document(
            vec![
                finflag(1),
                json!({ "name": "reg_x16", "size": 16, "bytes": [0, 0] }),
            ],
            json!([{ "name": "ram", "size": 0, "bytes": [] }]),
        );
        assert!(PlainResult::from_json(&input, None).is_err());
    }

    #[test]
    fn ram_length_is_checked() {
        let input = document(
            vec![finflag(1)],
            json!([{ "name": "ram", "size": 2, "bytes": [0, 0] }]),
        );
        assert!(PlainResult::from_json(&input, Some(512)).is_err());
    }

    #[test]
    fn repeated_bit_entry_is_a_schema_error() {
        let input = document(
            vec![finflag(0), finflag(1)],
            json!([{ "name": "ram", "size": 0, "bytes": [] }]),
        );
        let err = PlainResult::from_json(&input, None).unwrap_err();

        assert!(matches!(err, KvspError::Schema { name, .. } if name == "finflag"));
    }

    #[test]
    fn repeated_memory_block_is_a_schema_error() {
        let input = document(
            vec![finflag(1)],
            json!([
                { "name": "ram", "size": 1, "bytes": [1] },
                { "name": "ram", "size": 1, "bytes": [2] },
            ]),
        );
        let err = PlainResult::from_json(&input, None).unwrap_err();

        assert!(matches!(
            err,
            KvspError::Schema { name, reason } if name == "ram" && reason == "duplicate entry"
        ));
    }

    #[test]
    fn renders_text() {
        let regs: Vec<u16> = (0..16).map(|i| i * 10).collect();
        let ram: Vec<u8> = (0..20).collect();
        let result = PlainResult::from_values(5, &[true], &regs, ram).unwrap();
        let text = result.to_string();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "#cycle\t5");
        assert_eq!(lines[1], "#finflag\ttrue");
        assert_eq!(lines[2], "x0\t0");
        assert_eq!(lines[17], "x15\t150");
        assert_eq!(lines[18], "");
        assert_eq!(
            lines[19],
            "0000: 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f"
        );
        assert_eq!(lines[20], "0010: 10 11 12 13");
    }

    #[test]
    fn unknown_cycles_are_not_rendered() {
        let packet = PlainResponse {
            flags: vec![false, true],
            regs: vec![0; 16],
            ram: vec![],
        };
        let result = PlainResult::from_plain_response(&packet).unwrap();

        assert_eq!(result.flags.get("flag1"), Some(&true));
        assert!(result.to_string().starts_with("#finflag\tfalse\n"));
    }

    #[test]
    fn json_output_names_everything() {
        let result = PlainResult::from_values(3, &[true], &[1; 16], vec![0xff]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();

        assert_eq!(value["cycles"], 3);
        assert_eq!(value["flags"]["finflag"], true);
        assert_eq!(value["registers"]["reg_x3"], 1);
        assert_eq!(value["ram"], json!([255]));
    }
}
