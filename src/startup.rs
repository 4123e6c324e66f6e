//! Hosted C start-up layout (`argc`, `argv`, initial stack pointer) in RAM.
//!
//! Memory at the top of the image after [`attach`], from low to high:
//!
//! ```text
//! sp -> argc | argv[0] .. argv[argc-1] | NULL | [pad] | strings | sp slot
//! ```
//!
//! The last two bytes of the image always hold the initial stack pointer.

use crate::error::{KvspError, Result};

const WORD: usize = 2;

/// Writes the argument vector into the tail of `ram` and returns the
/// initial stack pointer. `argv[0]` is the empty program name.
///
/// Nothing is written when the layout does not fit.
pub fn attach<S: AsRef<str>>(ram: &mut [u8], args: &[S]) -> Result<u16> {
    let argv: Vec<&[u8]> = std::iter::once("")
        .chain(args.iter().map(|arg| arg.as_ref()))
        .map(str::as_bytes)
        .collect();
    let argc = argv.len();

    let strings: usize = argv.iter().map(|arg| arg.len() + 1).sum();
    // strings, alignment pad, pointers + NULL, argc, sp slot
    let required = strings + 1 + (argc + 1) * WORD + WORD + WORD;
    let overflow = || KvspError::LayoutOverflow {
        required,
        available: ram.len(),
    };

    if ram.len() > usize::from(u16::MAX) + 1 || argc > usize::from(u16::MAX) {
        return Err(overflow());
    }
    let mut cursor = ram.len().checked_sub(WORD).ok_or_else(overflow)?;
    cursor = cursor.checked_sub(strings).ok_or_else(overflow)?;
    cursor -= cursor % WORD;
    let sp = cursor
        .checked_sub((argc + 1) * WORD + WORD)
        .ok_or_else(overflow)?;

    let mut cursor = ram.len() - WORD;
    let mut pointers = Vec::with_capacity(argc);
    for arg in argv.iter().rev() {
        cursor -= 1;
        ram[cursor] = 0;
        cursor -= arg.len();
        ram[cursor..cursor + arg.len()].copy_from_slice(arg);
        pointers.push(cursor as u16);
    }

    cursor -= cursor % WORD;

    for pointer in std::iter::once(0).chain(pointers) {
        cursor -= WORD;
        put_word(ram, cursor, pointer);
    }

    cursor -= WORD;
    put_word(ram, cursor, argc as u16);
    debug_assert_eq!(cursor, sp);

    let last = ram.len() - WORD;
    put_word(ram, last, sp as u16);

    Ok(sp as u16)
}

fn put_word(ram: &mut [u8], at: usize, value: u16) {
    ram[at..at + WORD].copy_from_slice(&value.to_le_bytes());
}
