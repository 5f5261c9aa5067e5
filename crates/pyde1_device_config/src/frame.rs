//! Canonical on-wire frame encoding a profile compiles to. The specific
//! bit-for-bit DE1 register layout is an external interface concern; this
//! module only needs a deterministic, serializable byte encoding so that
//! two profiles compiling to the same instruction sequence produce the
//! same fingerprint.

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotDescHeader {
    pub header_version: u8,
    pub number_of_frames: u8,
    pub number_of_preinfuse_frames: u8,
    pub minimum_pressure: f32,
    pub maximum_flow: f32,
}

impl ShotDescHeader {
    fn write_canonical(&self, out: &mut Vec<u8>) {
        out.push(self.header_version);
        out.push(self.number_of_frames);
        out.push(self.number_of_preinfuse_frames);
        out.write_f32::<LittleEndian>(self.minimum_pressure).unwrap();
        out.write_f32::<LittleEndian>(self.maximum_flow).unwrap();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotFrame {
    pub flag: u8,
    pub set_val: f32,
    pub temp: f32,
    pub frame_len: f32,
    pub trigger_val: f32,
    pub max_vol: u16,
}

impl ShotFrame {
    fn write_canonical(&self, out: &mut Vec<u8>) {
        out.push(self.flag);
        out.write_f32::<LittleEndian>(self.set_val).unwrap();
        out.write_f32::<LittleEndian>(self.temp).unwrap();
        out.write_f32::<LittleEndian>(self.frame_len).unwrap();
        out.write_f32::<LittleEndian>(self.trigger_val).unwrap();
        out.write_u16::<LittleEndian>(self.max_vol).unwrap();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotExtFrame {
    pub max_range: f32,
    pub max_value: f32,
}

impl ShotExtFrame {
    fn write_canonical(&self, out: &mut Vec<u8>) {
        out.write_f32::<LittleEndian>(self.max_range).unwrap();
        out.write_f32::<LittleEndian>(self.max_value).unwrap();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotTail {
    pub target_volume: f32,
    pub target_weight: f32,
}

impl ShotTail {
    fn write_canonical(&self, out: &mut Vec<u8>) {
        out.write_f32::<LittleEndian>(self.target_volume).unwrap();
        out.write_f32::<LittleEndian>(self.target_weight).unwrap();
    }
}

/// The compiled instruction set a profile's source bytes produce. Two
/// sources that compile to an equal `CompiledFrames` must fingerprint
/// identically regardless of any metadata difference between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFrames {
    pub header: ShotDescHeader,
    pub frames: Vec<ShotFrame>,
    /// Extended frames, included as produced. Per the fingerprint policy
    /// an empty vec here is not normalised away: it is still concatenated
    /// (as zero bytes) into the canonical sequence.
    pub ext_frames: Vec<ShotExtFrame>,
    pub tail: ShotTail,
}

impl CompiledFrames {
    /// `ShotDescHeader ∥ ShotFrame[0..N-1] ∥ ShotExtFrame[0..M-1] ∥ ShotTail`,
    /// ascending index within each section.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + self.frames.len() * 15 + self.ext_frames.len() * 8 + 8,
        );
        self.header.write_canonical(&mut out);
        for frame in &self.frames {
            frame.write_canonical(&mut out);
        }
        for ext in &self.ext_frames {
            ext.write_canonical(&mut out);
        }
        self.tail.write_canonical(&mut out);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_ext_frames_still_yields_deterministic_bytes() {
        let compiled = CompiledFrames {
            header: ShotDescHeader {
                header_version: 1,
                number_of_frames: 0,
                number_of_preinfuse_frames: 0,
                minimum_pressure: 0.0,
                maximum_flow: 0.0,
            },
            frames: vec![],
            ext_frames: vec![],
            tail: ShotTail {
                target_volume: 0.0,
                target_weight: 0.0,
            },
        };
        let a = compiled.canonical_bytes();
        let b = compiled.canonical_bytes();
        assert_eq!(a, b);
    }
}
