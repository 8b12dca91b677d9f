// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Placeholders for reference pictures missing from the DPB.

use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::DpbError;
use crate::codec::h265::dpb::NewSlot;
use crate::codec::h265::picture::PicStruct;
use crate::codec::h265::picture::SlotFlags;
use crate::codec::h265::params::Sps;
use crate::video_frame::Frame;
use crate::video_frame::FrameBufferProvider;

/// Allocates a slot for the missing reference described by `new` and turns it into a flat,
/// mid-gray picture flagged `UNAVAILABLE`.
///
/// The frame is filled unless `fill` is false, which is the case when the buffer belongs to a
/// hardware accelerator. It is marked as produced right away so that no worker ever waits on it.
pub fn generate_missing_ref(
    dpb: &mut Dpb,
    provider: &dyn FrameBufferProvider,
    sps: &Sps,
    new: NewSlot,
    fill: bool,
) -> Result<usize, DpbError> {
    let poc = new.poc;
    let idx = dpb.alloc(
        provider,
        sps,
        NewSlot {
            flags: SlotFlags::UNAVAILABLE,
            pic_struct: PicStruct::Frame,
            ..new
        },
    )?;

    if let Some(frame) = dpb.slot(idx).and_then(|slot| slot.frame()) {
        if fill {
            fill_neutral(frame, sps.bit_depth);
        }
        frame.progress().mark_produced();
    }

    log::debug!(
        "Generated placeholder for missing POC {} in slot {} of layer {}",
        poc,
        idx,
        dpb.layer()
    );

    Ok(idx)
}

/// Sets every sample of `frame` to the middle of the range allowed by `bit_depth`.
pub fn fill_neutral(frame: &Frame, bit_depth: u8) {
    let value = 1u16 << (bit_depth.clamp(1, 16) - 1);
    let high_bit_depth = frame.format().is_high_bit_depth();
    let mut planes = frame.planes_mut();

    for plane in planes.iter_mut() {
        if high_bit_depth {
            for sample in plane.chunks_exact_mut(2) {
                sample.copy_from_slice(&value.to_le_bytes());
            }
        } else {
            plane.fill(value as u8);
        }
    }
}
