// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bitflags::bitflags;
use enumn::N;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

impl Reference {
    /// The DPB slot flag carrying this kind of reference.
    pub fn flag(&self) -> SlotFlags {
        match self {
            Reference::None => SlotFlags::empty(),
            Reference::ShortTerm => SlotFlags::SHORT_REF,
            Reference::LongTerm => SlotFlags::LONG_REF,
        }
    }
}

/// The `pic_struct` syntax element of the picture timing SEI. See Table D.2.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PicStruct {
    /// Progressive frame.
    #[default]
    Frame = 0,
    /// Top field.
    TopField = 1,
    /// Bottom field.
    BottomField = 2,
    /// Top field, bottom field, in that order.
    TopBottom = 3,
    /// Bottom field, top field, in that order.
    BottomTop = 4,
    /// Top field, bottom field, top field repeated, in that order.
    TopBottomTop = 5,
    /// Bottom field, top field, bottom field repeated, in that order.
    BottomTopBottom = 6,
    /// Frame doubling.
    FrameDoubling = 7,
    /// Frame tripling.
    FrameTripling = 8,
    /// Top field paired with previous bottom field in output order.
    TopPairedPrevBottom = 9,
    /// Bottom field paired with previous top field in output order.
    BottomPairedPrevTop = 10,
    /// Top field paired with next bottom field in output order.
    TopPairedNextBottom = 11,
    /// Bottom field paired with next top field in output order.
    BottomPairedNextTop = 12,
}

impl PicStruct {
    /// Whether the picture is displayed as (part of) an interlaced frame.
    pub fn is_interlaced(&self) -> bool {
        !matches!(
            self,
            PicStruct::Frame | PicStruct::FrameDoubling | PicStruct::FrameTripling
        )
    }

    /// Whether the top field is explicitly signaled as coming first.
    pub fn is_tff(&self) -> bool {
        matches!(
            self,
            PicStruct::TopBottom
                | PicStruct::TopBottomTop
                | PicStruct::BottomPairedPrevTop
                | PicStruct::TopPairedNextBottom
        )
    }

    /// Whether the bottom field is explicitly signaled as coming first.
    pub fn is_bff(&self) -> bool {
        matches!(
            self,
            PicStruct::BottomTop
                | PicStruct::BottomTopBottom
                | PicStruct::TopPairedPrevBottom
                | PicStruct::BottomPairedNextTop
        )
    }

    /// Whether the picture is a top field.
    pub fn is_top_field(&self) -> bool {
        matches!(
            self,
            PicStruct::TopField | PicStruct::TopPairedPrevBottom | PicStruct::TopPairedNextBottom
        )
    }

    /// Whether the picture is a bottom field.
    pub fn is_bottom_field(&self) -> bool {
        matches!(
            self,
            PicStruct::BottomField
                | PicStruct::BottomPairedPrevTop
                | PicStruct::BottomPairedNextTop
        )
    }

    /// Whether the picture is a single field rather than a frame.
    pub fn is_field_picture(&self) -> bool {
        self.is_top_field() || self.is_bottom_field()
    }

    pub fn is_frame_picture(&self) -> bool {
        !self.is_field_picture()
    }

    /// Number of extra field periods a frame with this structure is displayed for.
    pub fn repeat_pict(&self) -> u8 {
        match self {
            PicStruct::TopBottomTop | PicStruct::BottomTopBottom => 1,
            PicStruct::FrameDoubling => 2,
            PicStruct::FrameTripling => 3,
            _ => 0,
        }
    }
}

bitflags! {
    /// State bits of a DPB slot. A slot whose flags are empty is free.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SlotFlags: u8 {
        /// The picture is waiting to be output.
        const OUTPUT = 1 << 0;
        const SHORT_REF = 1 << 1;
        const LONG_REF = 1 << 2;
        /// The picture is a placeholder synthesized for a missing reference.
        const UNAVAILABLE = 1 << 3;
        const REFS = Self::SHORT_REF.bits() | Self::LONG_REF.bits();
    }
}

impl SlotFlags {
    /// The reference marking carried by these flags.
    pub fn reference(&self) -> Reference {
        if self.contains(SlotFlags::LONG_REF) {
            Reference::LongTerm
        } else if self.contains(SlotFlags::SHORT_REF) {
            Reference::ShortTerm
        } else {
            Reference::None
        }
    }
}

/// What a DPB slot is currently used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotStatus {
    /// The slot holds no picture.
    Free,
    /// The picture is only kept as a reference for future pictures.
    Reference(Reference),
    /// The picture is only waiting to be output.
    PendingOutput,
    /// The picture is both a reference and waiting to be output.
    Both(Reference),
    /// The picture is a concealment placeholder for a missing reference.
    Unavailable(Reference),
}

impl From<SlotFlags> for SlotStatus {
    fn from(flags: SlotFlags) -> Self {
        let reference = flags.reference();

        if flags.contains(SlotFlags::UNAVAILABLE) {
            SlotStatus::Unavailable(reference)
        } else if flags.contains(SlotFlags::OUTPUT) {
            match reference {
                Reference::None => SlotStatus::PendingOutput,
                _ => SlotStatus::Both(reference),
            }
        } else {
            match reference {
                Reference::None => SlotStatus::Free,
                _ => SlotStatus::Reference(reference),
            }
        }
    }
}
