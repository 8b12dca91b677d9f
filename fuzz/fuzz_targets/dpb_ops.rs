// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use std::sync::Arc;

use hevc_refs::codec::h265::params::LongTermRefPics;
use hevc_refs::codec::h265::params::NaluType;
use hevc_refs::codec::h265::params::SeiState;
use hevc_refs::codec::h265::params::ShortTermRefPicSet;
use hevc_refs::codec::h265::params::SliceHeader;
use hevc_refs::codec::h265::params::SliceType;
use hevc_refs::codec::h265::params::Sps;
use hevc_refs::codec::h265::picture::PicStruct;
use hevc_refs::decoder::h265::H265Context;
use hevc_refs::decoder::h265::PictureInfo;
use hevc_refs::video_frame::FramePool;
use libfuzzer_sys::fuzz_target;

/// Decodes one picture whose parameters are taken from `data`.
fn decode_picture(ctx: &mut H265Context, data: &mut impl Iterator<Item = u8>) -> anyhow::Result<()> {
    let mut next = || data.next().unwrap_or(0);

    let layer = usize::from(next() & 1);
    let poc = i32::from(next() as i8);
    let nalu_type = NaluType::n(i64::from(next() % 22)).unwrap_or(NaluType::TrailR);
    let pic_struct = PicStruct::n(next() % 13).unwrap_or_default();

    let num_negative_pics = usize::from(next() % 4);
    let num_positive_pics = usize::from(next() % 4);
    let delta_poc = (0..num_negative_pics)
        .map(|i| -(i as i32) - 1)
        .chain((0..num_positive_pics).map(|i| i as i32 + 1))
        .collect::<Vec<_>>();
    let used = delta_poc.iter().map(|_| next() & 1 != 0).collect();

    let lt = usize::from(next() % 3);
    let long_term_ref_pics = LongTermRefPics {
        poc: (0..lt).map(|_| i32::from(next())).collect(),
        used: (0..lt).map(|_| next() & 1 != 0).collect(),
        poc_msb_present: (0..lt).map(|_| next() & 1 != 0).collect(),
    };

    let type_ = SliceType::n(i64::from(next() % 3)).unwrap_or_default();
    let num_ref_idx_active = [usize::from(next() % 17), usize::from(next() % 17)];
    let hdr = SliceHeader {
        type_,
        pic_output_flag: next() & 1 != 0,
        short_term_ref_pic_set: (next() & 1 != 0).then_some(ShortTermRefPicSet {
            delta_poc,
            used,
            num_negative_pics,
        }),
        long_term_ref_pics,
        inter_layer_pred_enabled_flag: next() & 1 != 0,
        num_ref_idx_active,
        ref_pic_list_modification_flag: [next() & 1 != 0, next() & 1 != 0],
        list_entry: [
            (0..num_ref_idx_active[0]).map(|_| next() % 16).collect(),
            (0..num_ref_idx_active[1]).map(|_| next() % 16).collect(),
        ],
        collocated_list: usize::from(next() & 1),
        collocated_ref_idx: usize::from(next() % 16),
        ..Default::default()
    };

    ctx.set_sei(SeiState {
        pic_struct,
        ..Default::default()
    });
    ctx.set_new_ref(
        layer,
        &PictureInfo {
            poc,
            nalu_type,
            pic_output_flag: hdr.pic_output_flag,
            num_slices: 1,
            pps: Default::default(),
        },
    )?;

    let decoded = ctx
        .frame_rps(layer, &hdr)
        .and_then(|()| ctx.slice_rpl(&hdr, 0).map(drop));
    ctx.finish_frame();

    Ok(decoded?)
}

fuzz_target!(|data: &[u8]| {
    let pool = Arc::new(FramePool::with_budget(64));
    let mut ctx = H265Context::new(Default::default(), pool.clone());
    for layer in 0..2 {
        let _ = ctx.set_sps(
            layer,
            Arc::new(Sps {
                width: 32,
                height: 16,
                ..Default::default()
            }),
        );
    }

    let mut data = data.iter().copied();
    while let Some(op) = data.next() {
        let _ = match op % 4 {
            0 | 1 => decode_picture(&mut ctx, &mut data),
            2 => ctx
                .output_frames(3, 3, usize::from(op >> 4), usize::from((op >> 2) & 0x3), false)
                .map_err(Into::into),
            _ => ctx.flush_all().map_err(Into::into),
        };

        // Clients keep up with the output.
        ctx.output_queue().drain();
    }

    let _ = ctx.flush_all();
    ctx.output_queue().drain();
    drop(ctx);

    assert_eq!(pool.outstanding(), 0);
});
