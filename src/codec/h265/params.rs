// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream parameters consumed by the reference picture management.
//!
//! These are the subsets of the parameter sets, SEI messages and slice headers that the DPB,
//! the reference picture list construction and the output process need. They are filled by the
//! bitstream parser, which is outside of this crate.

use enumn::N;

use crate::codec::h265::picture::PicStruct;
use crate::video_frame::CropWindow;
use crate::DecodedFormat;
use crate::Resolution;

/// Number of slots in the DPB of each layer.
pub const MAX_DPB_SIZE: usize = 16;
/// Maximum number of entries in a reference picture list.
pub const MAX_REFS: usize = 16;
/// Maximum number of layers we can decode.
pub const MAX_LAYERS: usize = 2;

/// Table 7-1 – NAL unit type codes and NAL unit type classes, VCL types only.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is an IRAP NALU.
    pub fn is_irap(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::BlaWLp as u32 && type_ <= Self::CraNut as u32
    }

    /// Whether this is a BLA NALU.
    pub fn is_bla(&self) -> bool {
        matches!(self, Self::BlaWLp | Self::BlaWRadl | Self::BlaNLp)
    }

    /// Whether this is a CRA NALU.
    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Whether the references of this picture may legitimately be absent, i.e. decoding starts
    /// or restarts at this picture.
    pub fn may_miss_refs(&self) -> bool {
        self.is_cra() || self.is_bla()
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    #[default]
    P = 1,
    I = 2,
}

/// Sequence-level parameters of one layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    /// Coded width of the luma plane, in samples.
    pub width: u32,
    /// Coded height of the luma plane, in samples.
    pub height: u32,
    pub format: DecodedFormat,
    pub bit_depth: u8,
    /// MaxPicOrderCntLsb = 2^log2_max_pic_order_cnt_lsb.
    pub log2_max_pic_order_cnt_lsb: u8,
    pub log2_ctb_size: u8,
    /// The conformance window, in luma samples.
    pub output_window: CropWindow,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: DecodedFormat::I420,
            bit_depth: 8,
            log2_max_pic_order_cnt_lsb: 8,
            log2_ctb_size: 4,
            output_window: Default::default(),
        }
    }
}

impl Sps {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb
    }

    /// Width of the picture in CTBs.
    pub fn ctb_width(&self) -> usize {
        let ctb_size = 1usize << self.log2_ctb_size;
        (self.width as usize).div_ceil(ctb_size)
    }

    /// Height of the picture in CTBs.
    pub fn ctb_height(&self) -> usize {
        let ctb_size = 1usize << self.log2_ctb_size;
        (self.height as usize).div_ceil(ctb_size)
    }

    pub fn ctb_count(&self) -> usize {
        self.ctb_width() * self.ctb_height()
    }
}

/// Picture-level parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    /// The current picture may be used as a reference for itself (screen content coding).
    pub curr_pic_ref_enabled_flag: bool,
    /// CtbAddrRsToTs. Left empty when tiles are not used, in which case raster and tile scan
    /// orders are the same.
    pub ctb_addr_rs_to_ts: Vec<usize>,
}

impl Pps {
    /// Converts a CTB address in raster scan to the tile scan order.
    pub fn ctb_addr_rs_to_ts(&self, ctb_addr_rs: usize) -> usize {
        self.ctb_addr_rs_to_ts
            .get(ctb_addr_rs)
            .copied()
            .unwrap_or(ctb_addr_rs)
    }
}

/// Video-level parameters describing the layers of the stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    pub num_layers: usize,
    pub view_id: [u32; MAX_LAYERS],
}

/// The three-dimensional reference displays information SEI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefDisplaysInfo {
    pub left_view_id: u32,
    pub right_view_id: u32,
}

/// SEI state that applies to the picture about to be decoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeiState {
    /// From the picture timing SEI.
    pub pic_struct: PicStruct,
    /// Set when the three-dimensional reference displays SEI lists at least one display.
    pub ref_displays: Option<RefDisplaysInfo>,
}

/// The short-term reference picture set of a picture. See 7.4.8.
///
/// `delta_poc` holds the negative entries first (DeltaPocS0, closest first), followed by the
/// positive ones (DeltaPocS1, closest first).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub delta_poc: Vec<i32>,
    /// UsedByCurrPicS0/UsedByCurrPicS1, with the same layout as `delta_poc`.
    pub used: Vec<bool>,
    pub num_negative_pics: usize,
}

impl ShortTermRefPicSet {
    pub fn num_delta_pocs(&self) -> usize {
        self.delta_poc.len()
    }
}

/// The long-term reference pictures of a picture, with their POC already derived.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LongTermRefPics {
    /// PocLsbLt, or the full POC when `poc_msb_present` is set.
    pub poc: Vec<i32>,
    /// UsedByCurrPicLt.
    pub used: Vec<bool>,
    /// delta_poc_msb_present_flag.
    pub poc_msb_present: Vec<bool>,
}

impl LongTermRefPics {
    pub fn len(&self) -> usize {
        self.poc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poc.is_empty()
    }
}

/// The slice header fields involved in reference picture management.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub type_: SliceType,
    pub pic_output_flag: bool,
    /// Address of the first CTB of the slice segment, in raster scan.
    pub segment_address: usize,
    /// `None` for IDR pictures.
    pub short_term_ref_pic_set: Option<ShortTermRefPicSet>,
    pub long_term_ref_pics: LongTermRefPics,
    pub inter_layer_pred_enabled_flag: bool,
    /// num_ref_idx_l0_active_minus1 + 1 and num_ref_idx_l1_active_minus1 + 1.
    pub num_ref_idx_active: [usize; 2],
    pub ref_pic_list_modification_flag: [bool; 2],
    /// list_entry_l0 and list_entry_l1.
    pub list_entry: [Vec<u8>; 2],
    /// 0 if the collocated picture comes from list 0, 1 for list 1.
    pub collocated_list: usize,
    pub collocated_ref_idx: usize,
}

impl SliceHeader {
    /// Number of reference picture lists used by the slice.
    pub fn num_ref_lists(&self) -> usize {
        match self.type_ {
            SliceType::B => 2,
            SliceType::P => 1,
            SliceType::I => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nalu_type_classes() {
        assert!(NaluType::CraNut.is_irap());
        assert!(NaluType::BlaNLp.is_irap());
        assert!(!NaluType::RaslR.is_irap());
        assert!(NaluType::IdrNLp.is_idr());
        assert!(NaluType::BlaWRadl.may_miss_refs());
        assert!(!NaluType::IdrWRadl.may_miss_refs());
        assert_eq!(NaluType::n(21), Some(NaluType::CraNut));
        assert_eq!(NaluType::n(12), None);
    }

    #[test]
    fn test_ctb_geometry() {
        let sps = Sps {
            width: 1920,
            height: 1080,
            log2_ctb_size: 6,
            ..Default::default()
        };

        assert_eq!(sps.ctb_width(), 30);
        assert_eq!(sps.ctb_height(), 17);
        assert_eq!(sps.ctb_count(), 510);
        assert_eq!(sps.max_pic_order_cnt_lsb(), 256);
    }

    #[test]
    fn test_ctb_scan_conversion() {
        let pps = Pps {
            ctb_addr_rs_to_ts: vec![0, 2, 1, 3],
            ..Default::default()
        };
        assert_eq!(pps.ctb_addr_rs_to_ts(1), 2);
        assert_eq!(Pps::default().ctb_addr_rs_to_ts(7), 7);
    }
}
