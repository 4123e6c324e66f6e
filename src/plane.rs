//! Splitting a RAM image into two interleaved byte planes and back.
//!
//! Plane A holds the bytes at odd offsets, plane B the bytes at even
//! offsets, each in address order.

use crate::error::{KvspError, Result};

pub const PLANE_A: &str = "ramA";
pub const PLANE_B: &str = "ramB";

pub fn split(image: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if image.len() % 2 != 0 {
        return Err(KvspError::UnevenImage(image.len()));
    }

    let (a, b) = image
        .chunks_exact(2)
        .map(|pair| (pair[1], pair[0]))
        .unzip();
    Ok((a, b))
}

pub fn merge(plane_a: &[u8], plane_b: &[u8]) -> Result<Vec<u8>> {
    if plane_a.len() != plane_b.len() {
        return Err(KvspError::Schema {
            name: PLANE_A.to_owned(),
            reason: format!(
                "plane lengths differ ({} vs {} bytes)",
                plane_a.len(),
                plane_b.len()
            ),
        });
    }

    Ok(plane_b
        .iter()
        .zip(plane_a)
        .flat_map(|(&even, &odd)| [even, odd])
        .collect())
}
