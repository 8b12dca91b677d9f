// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture management for H.265 decoders.
//!
//! This crate owns the parts of a H.265 decoder that deal with decoded pictures once the
//! bitstream has been parsed: the Decoded Picture Buffer ([`codec::h265::dpb`]), the construction
//! of the reference picture lists for each slice, the synthesis of placeholders for missing
//! references, and the output process that bumps pictures out of the DPB in presentation order,
//! pairing separately-coded fields back into interlaced frames on the way
//! ([`decoder::h265::H265Context`]).
//!
//! Pixel storage is provided by a [`video_frame::FrameBufferProvider`], and finished pictures are
//! handed to the client through a [`decoder::OutputQueue`].

pub mod codec;
pub mod decoder;
pub mod video_frame;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    /// Y, UV planes, 4:2:0 chroma subsampling, 8 bits per sample.
    NV12,
    /// Y, U and V planes, 4:2:0 chroma subsampling, 8 bits per sample.
    I420,
    /// Y, U and V planes, 4:2:2 chroma subsampling, 8 bits per sample.
    I422,
    /// Y, U and V planes, 4:4:4 chroma subsampling, 8 bits per sample.
    I444,
    /// Y, U and V planes, 4:2:0 chroma subsampling, 10 bits per sample (little-endian u16).
    I010,
    /// Y, U and V planes, 4:2:0 chroma subsampling, 12 bits per sample (little-endian u16).
    I012,
    /// Y, U and V planes, 4:2:2 chroma subsampling, 10 bits per sample (little-endian u16).
    I210,
    /// Y, U and V planes, 4:2:2 chroma subsampling, 12 bits per sample (little-endian u16).
    I212,
    /// Y, U and V planes, 4:4:4 chroma subsampling, 10 bits per sample (little-endian u16).
    I410,
    /// Y, U and V planes, 4:4:4 chroma subsampling, 12 bits per sample (little-endian u16).
    I412,
}

impl DecodedFormat {
    pub fn num_planes(&self) -> usize {
        match self {
            DecodedFormat::NV12 => 2,
            _ => 3,
        }
    }

    /// Number of significant bits in each sample.
    pub fn bit_depth(&self) -> u8 {
        match self {
            DecodedFormat::NV12
            | DecodedFormat::I420
            | DecodedFormat::I422
            | DecodedFormat::I444 => 8,
            DecodedFormat::I010 | DecodedFormat::I210 | DecodedFormat::I410 => 10,
            DecodedFormat::I012 | DecodedFormat::I212 | DecodedFormat::I412 => 12,
        }
    }

    pub fn horizontal_subsampling(&self, plane: usize) -> usize {
        if plane == 0 {
            return 1;
        }

        match self {
            DecodedFormat::I444 | DecodedFormat::I410 | DecodedFormat::I412 => 1,
            _ => 2,
        }
    }

    pub fn vertical_subsampling(&self, plane: usize) -> usize {
        if plane == 0 {
            return 1;
        }

        match self {
            DecodedFormat::NV12
            | DecodedFormat::I420
            | DecodedFormat::I010
            | DecodedFormat::I012 => 2,
            _ => 1,
        }
    }

    /// Size in bytes of one element of `plane`. The interleaved UV plane of NV12 has two bytes
    /// per element.
    pub fn bytes_per_element(&self, plane: usize) -> usize {
        match self {
            DecodedFormat::I420 | DecodedFormat::I422 | DecodedFormat::I444 => 1,
            DecodedFormat::NV12 => {
                if plane == 0 {
                    1
                } else {
                    2
                }
            }
            _ => 2,
        }
    }

    /// Whether samples are stored as 16-bit words rather than bytes.
    pub fn is_high_bit_depth(&self) -> bool {
        self.bit_depth() > 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_geometry() {
        assert_eq!(DecodedFormat::NV12.num_planes(), 2);
        assert_eq!(DecodedFormat::NV12.bytes_per_element(1), 2);
        assert_eq!(DecodedFormat::I420.vertical_subsampling(2), 2);
        assert_eq!(DecodedFormat::I422.vertical_subsampling(2), 1);
        assert_eq!(DecodedFormat::I444.horizontal_subsampling(1), 1);
        assert_eq!(DecodedFormat::I212.bit_depth(), 12);
        assert!(DecodedFormat::I410.is_high_bit_depth());
    }
}
