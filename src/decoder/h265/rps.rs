// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture set derivation (8.3.2) and reference picture list construction (8.3.4).

use std::ops::Index;
use std::ops::IndexMut;

use anyhow::anyhow;

use crate::codec::h265::concealment::generate_missing_ref;
use crate::codec::h265::dpb::RefPicList;
use crate::codec::h265::dpb::RefPicListEntry;
use crate::codec::h265::dpb::SliceRefLists;
use crate::codec::h265::dpb::SlotRef;
use crate::codec::h265::params::Pps;
use crate::codec::h265::params::SliceHeader;
use crate::codec::h265::params::MAX_REFS;
use crate::codec::h265::picture::Reference;
use crate::codec::h265::picture::SlotFlags;
use crate::decoder::h265::H265Context;
use crate::decoder::Error;
use crate::decoder::Result;

/// The subsets of the reference picture set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpsType {
    StCurrBefore = 0,
    StCurrAfter,
    StFoll,
    LtCurr,
    LtFoll,
    InterLayer0,
    InterLayer1,
}

pub const NUM_RPS_TYPES: usize = 7;

impl RpsType {
    /// Whether the pictures of this subset enter the reference picture lists as long-term
    /// references. Inter-layer references are treated as long-term, cf. G.8.1.3.
    pub fn is_long_term(&self) -> bool {
        matches!(
            self,
            RpsType::LtCurr | RpsType::InterLayer0 | RpsType::InterLayer1
        )
    }

    /// Order in which the subsets are concatenated into RefPicListTemp0 and RefPicListTemp1.
    fn list_order(list_idx: usize) -> [RpsType; 5] {
        if list_idx == 0 {
            [
                RpsType::StCurrBefore,
                RpsType::InterLayer0,
                RpsType::StCurrAfter,
                RpsType::LtCurr,
                RpsType::InterLayer1,
            ]
        } else {
            [
                RpsType::StCurrAfter,
                RpsType::InterLayer1,
                RpsType::StCurrBefore,
                RpsType::LtCurr,
                RpsType::InterLayer0,
            ]
        }
    }
}

/// The reference picture set of the current picture, one list of pictures per subset.
#[derive(Clone, Debug, Default)]
pub struct RefPicSets([RefPicList; NUM_RPS_TYPES]);

impl RefPicSets {
    pub fn clear(&mut self) {
        for set in self.0.iter_mut() {
            set.clear();
        }
    }
}

impl Index<RpsType> for RefPicSets {
    type Output = RefPicList;

    fn index(&self, index: RpsType) -> &Self::Output {
        &self.0[index as usize]
    }
}

impl IndexMut<RpsType> for RefPicSets {
    fn index_mut(&mut self, index: RpsType) -> &mut Self::Output {
        &mut self.0[index as usize]
    }
}

/// Returns NumPicTotalCurr, the number of pictures usable as reference by the current picture.
/// See equation 7-55.
pub fn frame_nb_refs(hdr: &SliceHeader, pps: &Pps) -> usize {
    let mut total = 0;

    if let Some(st) = &hdr.short_term_ref_pic_set {
        total += st.used.iter().take(st.num_delta_pocs()).filter(|u| **u).count();
    }

    total += hdr.long_term_ref_pics.used.iter().filter(|u| **u).count();

    if hdr.inter_layer_pred_enabled_flag {
        total += 1;
    }

    if pps.curr_pic_ref_enabled_flag {
        total += 1;
    }

    total
}

impl H265Context {
    /// The reference picture set derived by the last call to `frame_rps`.
    pub fn rps(&self) -> &RefPicSets {
        &self.rps
    }

    /// Derives the reference picture set of the current picture of `layer` and marks the DPB
    /// accordingly. See the second half of 8.3.2.
    ///
    /// Pictures missing from the DPB are replaced by placeholders. Pictures not part of the set
    /// lose their reference marking and are released unless they are waiting for output.
    pub fn frame_rps(&mut self, layer: usize, hdr: &SliceHeader) -> Result<()> {
        let cur = self.cur;
        {
            let dpb = &mut self.layer_mut(layer)?.dpb;
            dpb.unref_missing_refs();

            for index in 0..dpb.capacity() {
                if cur != Some(SlotRef { layer, index }) {
                    dpb.mark_ref(index, Reference::None);
                }
            }
        }

        self.rps.clear();

        let ret = self.add_rps_candidates(layer, hdr);

        // Whatever happened, release the pictures that are now unused.
        self.layers[layer].dpb.release_unused();

        ret
    }

    fn add_rps_candidates(&mut self, layer: usize, hdr: &SliceHeader) -> Result<()> {
        if let Some(st) = &hdr.short_term_ref_pic_set {
            for (i, delta_poc) in st.delta_poc.iter().enumerate() {
                let poc = self.poc + delta_poc;
                let used = st.used.get(i).copied().unwrap_or(false);

                let type_ = if !used {
                    RpsType::StFoll
                } else if i < st.num_negative_pics {
                    RpsType::StCurrBefore
                } else {
                    RpsType::StCurrAfter
                };

                self.add_candidate_ref(layer, type_, poc, Reference::ShortTerm, true)?;
            }

            let lt = &hdr.long_term_ref_pics;
            for (i, &poc) in lt.poc.iter().enumerate() {
                let used = lt.used.get(i).copied().unwrap_or(false);
                let msb_present = lt.poc_msb_present.get(i).copied().unwrap_or(false);

                let type_ = if used {
                    RpsType::LtCurr
                } else {
                    RpsType::LtFoll
                };

                self.add_candidate_ref(layer, type_, poc, Reference::LongTerm, msb_present)?;
            }
        }

        if hdr.inter_layer_pred_enabled_flag {
            if layer == 0 {
                return Err(Error::InterLayerOnBaseLayer);
            }

            // With at most two layers, only RefPicSetInterLayer0 can ever contain a picture.
            let base_poc = self.layers[0]
                .cur_frame
                .and_then(|idx| self.layers[0].dpb.slot(idx))
                .map(|slot| slot.poc());

            if let Some(poc) = base_poc {
                // Inter-layer references are marked as short-term, cf. F.8.1.6.
                self.add_candidate_ref(0, RpsType::InterLayer0, poc, Reference::ShortTerm, true)?;
            }
        }

        Ok(())
    }

    /// Looks up `poc` in the DPB of `layer`, adds it to the `type_` subset and marks it with
    /// `reference`.
    fn add_candidate_ref(
        &mut self,
        layer: usize,
        type_: RpsType,
        poc: i32,
        reference: Reference,
        use_msb: bool,
    ) -> Result<()> {
        let sps = self.layer_sps(layer)?;
        let found = self.layers[layer].dpb.find_ref_idx(
            poc,
            use_msb,
            sps.log2_max_pic_order_cnt_lsb,
            self.poc,
        );

        if found.is_none() && !self.nalu_type.may_miss_refs() {
            log::error!("Could not find ref with POC {}", poc);
        }

        let is_current = found.is_some_and(|index| self.cur == Some(SlotRef { layer, index }));
        if is_current || self.rps[type_].is_full() {
            return Err(Error::DuplicateOrMissingReference { poc });
        }

        let index = match found {
            Some(index) => index,
            None => {
                let new = self.new_slot(layer, &sps, poc, SlotFlags::UNAVAILABLE);
                generate_missing_ref(
                    &mut self.layers[layer].dpb,
                    self.provider.as_ref(),
                    &sps,
                    new,
                    !self.config.hwaccel,
                )?
            }
        };

        let dpb = &mut self.layers[layer].dpb;
        let ref_poc = dpb.slot(index).map(|s| s.poc()).unwrap_or(poc);
        dpb.mark_ref(index, reference);

        self.rps[type_].push(RefPicListEntry {
            poc: ref_poc,
            slot: SlotRef { layer, index },
            is_long_term: reference == Reference::LongTerm,
        });

        Ok(())
    }

    /// Makes the CTBs of the slice starting at `hdr.segment_address` use the lists of slice
    /// `slice_idx` of the current picture.
    pub fn init_slice_rpl(&mut self, hdr: &SliceHeader, slice_idx: usize) -> Result<()> {
        let cur = self
            .cur
            .ok_or_else(|| Error::Other(anyhow!("no picture is being decoded")))?;
        let pps = self
            .pps
            .clone()
            .ok_or_else(|| Error::Other(anyhow!("no active PPS")))?;

        let ctb_addr_ts = pps.ctb_addr_rs_to_ts(hdr.segment_address);
        self.slot_mut(cur)?
            .select_slice_lists(slice_idx, ctb_addr_ts)?;

        Ok(())
    }

    /// Builds RefPicList0 and RefPicList1 of slice `slice_idx` of the current picture from the
    /// reference picture set, and stores them in the picture. See 8.3.4.
    pub fn slice_rpl(&mut self, hdr: &SliceHeader, slice_idx: usize) -> Result<SliceRefLists> {
        self.init_slice_rpl(hdr, slice_idx)?;

        let num_lists = hdr.num_ref_lists();
        if num_lists == 0 {
            return Ok(Default::default());
        }

        let cur = self
            .cur
            .ok_or_else(|| Error::Other(anyhow!("no picture is being decoded")))?;
        let curr_pic_ref = self
            .pps
            .as_ref()
            .is_some_and(|pps| pps.curr_pic_ref_enabled_flag);

        let num_candidates: usize = [
            RpsType::StCurrBefore,
            RpsType::StCurrAfter,
            RpsType::LtCurr,
            RpsType::InterLayer0,
            RpsType::InterLayer1,
        ]
        .iter()
        .map(|t| self.rps[*t].len())
        .sum();

        if num_candidates == 0 && !curr_pic_ref {
            log::error!("Zero refs in the frame RPS.");
            return Err(Error::ZeroReferences);
        }

        let current = RefPicListEntry {
            poc: self.poc,
            slot: cur,
            is_long_term: true,
        };

        let mut lists: SliceRefLists = Default::default();
        for (list_idx, list) in lists.iter_mut().enumerate().take(num_lists) {
            let num_refs = hdr.num_ref_idx_active[list_idx];
            if num_refs > MAX_REFS {
                return Err(Error::TooManyReferences(num_refs));
            }

            let temp = self.build_temp_list(list_idx, num_refs, curr_pic_ref.then_some(&current));

            if hdr.ref_pic_list_modification_flag[list_idx] {
                // Equations 8-9 and 8-11.
                for i in 0..num_refs {
                    let idx = hdr.list_entry[list_idx].get(i).copied().unwrap_or(0) as usize;
                    let entry = temp.get(idx).ok_or_else(|| {
                        log::error!("Invalid reference index.");
                        Error::InvalidReferenceIndex {
                            idx,
                            len: temp.len(),
                        }
                    })?;

                    list.push(entry.clone());
                }
            } else {
                *list = temp.clone();
                list.truncate(num_refs);

                // The current picture must stay in the list when it was truncated out.
                if curr_pic_ref && temp.len() > num_refs {
                    if let Some(last) = num_refs
                        .checked_sub(1)
                        .and_then(|i| list.entries_mut().get_mut(i))
                    {
                        *last = current.clone();
                    }
                }
            }

            if hdr.collocated_list == list_idx {
                if let Some(entry) = list.get(hdr.collocated_ref_idx) {
                    self.collocated_ref = Some(entry.slot);
                }
            }
        }

        log::debug!(
            "Slice {} of POC {}: L0 {:?} L1 {:?}",
            slice_idx,
            self.poc,
            lists[0].pocs(),
            lists[1].pocs()
        );

        if let Some(slot_lists) = self.slot_mut(cur)?.current_ref_lists_mut() {
            *slot_lists = lists.clone();
        }

        Ok(lists)
    }

    /// Builds RefPicListTemp0 or RefPicListTemp1, cycling through the subsets until `num_refs`
    /// entries are available. Equations 8-8 and 8-10.
    fn build_temp_list(
        &self,
        list_idx: usize,
        num_refs: usize,
        current: Option<&RefPicListEntry>,
    ) -> RefPicList {
        let mut temp = RefPicList::default();

        while temp.len() < num_refs && !temp.is_full() {
            for type_ in RpsType::list_order(list_idx) {
                for entry in self.rps[type_].entries() {
                    temp.push(RefPicListEntry {
                        is_long_term: type_.is_long_term(),
                        ..entry.clone()
                    });
                }
            }

            if let Some(current) = current {
                temp.push(current.clone());
            }
        }

        temp
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::h265::params::LongTermRefPics;
    use crate::codec::h265::params::NaluType;
    use crate::codec::h265::params::ShortTermRefPicSet;
    use crate::codec::h265::params::SliceType;
    use crate::codec::h265::picture::PicStruct;
    use crate::codec::h265::picture::SlotStatus;
    use crate::decoder::h265::tests::context;
    use crate::decoder::h265::tests::decode;
    use crate::decoder::h265::tests::picture;
    use crate::decoder::h265::tests::sps;
    use crate::decoder::h265::PictureInfo;

    fn st_rps(negative: &[i32], positive: &[i32], used: &[bool]) -> ShortTermRefPicSet {
        ShortTermRefPicSet {
            delta_poc: negative.iter().chain(positive).copied().collect(),
            used: used.to_vec(),
            num_negative_pics: negative.len(),
        }
    }

    fn b_slice(st: ShortTermRefPicSet, num_refs: [usize; 2]) -> SliceHeader {
        SliceHeader {
            type_: SliceType::B,
            pic_output_flag: true,
            short_term_ref_pic_set: Some(st),
            num_ref_idx_active: num_refs,
            ..Default::default()
        }
    }

    /// Decodes POCs 0, 8 and 4 as frames, then starts POC 2.
    fn hierarchy() -> (H265Context, Arc<crate::video_frame::FramePool>) {
        let (mut ctx, pool) = context(Default::default());
        for poc in [0, 8, 4] {
            decode(&mut ctx, poc, PicStruct::Frame);
        }
        ctx.set_new_ref(0, &picture(2)).unwrap();
        (ctx, pool)
    }

    #[test]
    fn test_rps_classification() {
        let (mut ctx, _pool) = hierarchy();

        let hdr = b_slice(st_rps(&[-2], &[2, 6], &[true, true, false]), [2, 2]);
        ctx.frame_rps(0, &hdr).unwrap();

        assert_eq!(ctx.rps()[RpsType::StCurrBefore].pocs(), vec![0]);
        assert_eq!(ctx.rps()[RpsType::StCurrAfter].pocs(), vec![4]);
        assert_eq!(ctx.rps()[RpsType::StFoll].pocs(), vec![8]);
        assert!(ctx.rps()[RpsType::LtCurr].is_empty());

        for slot in ctx.dpb(0).unwrap().slots().iter().filter(|s| !s.is_free()) {
            assert!(slot.flags().contains(SlotFlags::SHORT_REF));
        }
    }

    #[test]
    fn test_unused_pictures_lose_reference() {
        let (mut ctx, pool) = context(Default::default());
        let first = decode(&mut ctx, 0, PicStruct::Frame);
        ctx.set_new_ref(
            0,
            &PictureInfo {
                pic_output_flag: false,
                ..picture(1)
            },
        )
        .unwrap();
        ctx.finish_frame();
        ctx.set_new_ref(0, &picture(2)).unwrap();

        // Only POC 1 stays a reference. POC 0 still waits for output.
        let hdr = b_slice(st_rps(&[-1], &[], &[true]), [1, 1]);
        ctx.frame_rps(0, &hdr).unwrap();

        assert_eq!(ctx.slot(first).unwrap().status(), SlotStatus::PendingOutput);
        assert_eq!(ctx.dpb(0).unwrap().num_in_use(), 3);

        // Now nothing references POC 1, which is not waiting for output either.
        let hdr = b_slice(st_rps(&[-2], &[], &[true]), [1, 1]);
        ctx.frame_rps(0, &hdr).unwrap();
        assert_eq!(ctx.dpb(0).unwrap().num_in_use(), 2);
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_list_construction() {
        let (mut ctx, _pool) = hierarchy();

        let hdr = b_slice(st_rps(&[-2], &[2, 6], &[true, true, true]), [3, 3]);
        ctx.frame_rps(0, &hdr).unwrap();
        let lists = ctx.slice_rpl(&hdr, 0).unwrap();

        assert_eq!(lists[0].pocs(), vec![0, 4, 8]);
        assert_eq!(lists[1].pocs(), vec![4, 8, 0]);
        assert!(lists[0].entries().iter().all(|e| !e.is_long_term));
    }

    #[test]
    fn test_list_cycles_candidates() {
        let (mut ctx, _pool) = hierarchy();

        let hdr = b_slice(st_rps(&[-2], &[2], &[true, true]), [5, 1]);
        ctx.frame_rps(0, &hdr).unwrap();
        let lists = ctx.slice_rpl(&hdr, 0).unwrap();

        assert_eq!(lists[0].pocs(), vec![0, 4, 0, 4, 0]);
        assert_eq!(lists[1].pocs(), vec![4]);
    }

    #[test]
    fn test_list_truncation_length() {
        let (mut ctx, _pool) = hierarchy();

        let hdr = SliceHeader {
            type_: SliceType::P,
            ..b_slice(st_rps(&[-2], &[2, 6], &[true, true, true]), [2, 0])
        };
        ctx.frame_rps(0, &hdr).unwrap();
        let lists = ctx.slice_rpl(&hdr, 0).unwrap();

        assert_eq!(lists[0].len(), 2);
        assert!(lists[1].is_empty());
    }

    #[test]
    fn test_long_term_refs() {
        let (mut ctx, _pool) = hierarchy();

        let hdr = SliceHeader {
            long_term_ref_pics: LongTermRefPics {
                poc: vec![8],
                used: vec![true],
                poc_msb_present: vec![false],
            },
            ..b_slice(st_rps(&[-2], &[], &[true]), [3, 2])
        };
        ctx.frame_rps(0, &hdr).unwrap();
        let lists = ctx.slice_rpl(&hdr, 0).unwrap();

        assert_eq!(lists[0].pocs(), vec![0, 8, 0]);
        assert_eq!(
            lists[0]
                .entries()
                .iter()
                .map(|e| e.is_long_term)
                .collect::<Vec<_>>(),
            vec![false, true, false]
        );

        let lt = lists[0].get(1).unwrap().slot;
        assert_eq!(ctx.slot(lt).unwrap().flags().reference(), Reference::LongTerm);
    }

    #[test]
    fn test_list_modification() {
        let (mut ctx, _pool) = hierarchy();

        let mut hdr = b_slice(st_rps(&[-2], &[2, 6], &[true, true, true]), [2, 1]);
        hdr.ref_pic_list_modification_flag = [true, false];
        hdr.list_entry = [vec![2, 2], vec![]];
        ctx.frame_rps(0, &hdr).unwrap();
        let lists = ctx.slice_rpl(&hdr, 0).unwrap();
        assert_eq!(lists[0].pocs(), vec![8, 8]);

        hdr.list_entry = [vec![0, 3], vec![]];
        let err = ctx.slice_rpl(&hdr, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidReferenceIndex { idx: 3, len: 3 }
        ));
    }

    #[test]
    fn test_current_picture_reference() {
        let (mut ctx, _pool) = context(Default::default());
        decode(&mut ctx, 0, PicStruct::Frame);
        decode(&mut ctx, 1, PicStruct::Frame);
        let cur = ctx
            .set_new_ref(
                0,
                &PictureInfo {
                    pps: Arc::new(Pps {
                        curr_pic_ref_enabled_flag: true,
                        ..Default::default()
                    }),
                    ..picture(2)
                },
            )
            .unwrap();

        let hdr = SliceHeader {
            type_: SliceType::P,
            ..b_slice(st_rps(&[-1, -2], &[], &[true, true]), [2, 0])
        };
        ctx.frame_rps(0, &hdr).unwrap();
        let lists = ctx.slice_rpl(&hdr, 0).unwrap();

        // RefPicListTemp0 is [1, 0, 2]: the current picture takes the last entry.
        assert_eq!(lists[0].pocs(), vec![1, 2]);
        assert_eq!(lists[0].get(1).unwrap().slot, cur);
        assert!(lists[0].get(1).unwrap().is_long_term);
    }

    #[test]
    fn test_only_current_picture_reference() {
        let (mut ctx, _pool) = context(Default::default());
        ctx.set_new_ref(
            0,
            &PictureInfo {
                nalu_type: NaluType::IdrNLp,
                pps: Arc::new(Pps {
                    curr_pic_ref_enabled_flag: true,
                    ..Default::default()
                }),
                ..picture(0)
            },
        )
        .unwrap();

        let hdr = SliceHeader {
            type_: SliceType::P,
            num_ref_idx_active: [2, 0],
            ..Default::default()
        };
        ctx.frame_rps(0, &hdr).unwrap();
        let lists = ctx.slice_rpl(&hdr, 0).unwrap();
        assert_eq!(lists[0].pocs(), vec![0, 0]);
    }

    #[test]
    fn test_zero_references() {
        let (mut ctx, _pool) = context(Default::default());
        ctx.set_new_ref(0, &picture(0)).unwrap();

        let hdr = SliceHeader {
            type_: SliceType::P,
            num_ref_idx_active: [1, 0],
            ..Default::default()
        };
        ctx.frame_rps(0, &hdr).unwrap();
        assert!(matches!(
            ctx.slice_rpl(&hdr, 0),
            Err(Error::ZeroReferences)
        ));

        // I slices need no reference.
        let hdr = SliceHeader {
            type_: SliceType::I,
            ..hdr
        };
        assert!(ctx.slice_rpl(&hdr, 0).unwrap()[0].is_empty());
    }

    #[test]
    fn test_too_many_references() {
        let (mut ctx, _pool) = hierarchy();

        let hdr = b_slice(st_rps(&[-2], &[], &[true]), [MAX_REFS + 1, 1]);
        ctx.frame_rps(0, &hdr).unwrap();
        assert!(matches!(
            ctx.slice_rpl(&hdr, 0),
            Err(Error::TooManyReferences(17))
        ));
    }

    #[test]
    fn test_missing_reference_is_synthesized() {
        let (mut ctx, pool) = hierarchy();

        let hdr = b_slice(st_rps(&[-1], &[], &[true]), [1, 1]);
        ctx.frame_rps(0, &hdr).unwrap();

        let placeholder = ctx.rps()[RpsType::StCurrBefore].get(0).unwrap().slot;
        let slot = ctx.slot(placeholder).unwrap();
        assert_eq!(slot.poc(), 1);
        assert_eq!(slot.status(), SlotStatus::Unavailable(Reference::ShortTerm));
        assert!(slot.frame().unwrap().progress().is_produced());
        assert!(slot.frame().unwrap().planes()[0].iter().all(|&b| b == 128));

        let lists = ctx.slice_rpl(&hdr, 0).unwrap();
        assert_eq!(lists[0].pocs(), vec![1]);

        // The placeholder only lives until the next derivation.
        let outstanding = pool.outstanding();
        ctx.frame_rps(0, &b_slice(st_rps(&[-2], &[], &[true]), [1, 1]))
            .unwrap();
        assert!(ctx.slot(placeholder).unwrap().is_free());
        assert!(pool.outstanding() < outstanding);
    }

    #[test]
    fn test_missing_reference_on_cra() {
        let (mut ctx, _pool) = context(Default::default());
        ctx.set_new_ref(
            0,
            &PictureInfo {
                nalu_type: NaluType::CraNut,
                ..picture(16)
            },
        )
        .unwrap();

        let hdr = b_slice(st_rps(&[-4], &[], &[false]), [1, 1]);
        ctx.frame_rps(0, &hdr).unwrap();
        assert_eq!(ctx.rps()[RpsType::StFoll].pocs(), vec![12]);
    }

    #[test]
    fn test_current_picture_in_rps() {
        let (mut ctx, _pool) = context(Default::default());
        ctx.set_new_ref(0, &picture(4)).unwrap();

        // A delta of zero designates the current picture itself.
        let hdr = b_slice(st_rps(&[0], &[], &[true]), [1, 1]);
        assert!(matches!(
            ctx.frame_rps(0, &hdr),
            Err(Error::DuplicateOrMissingReference { poc: 4 })
        ));
    }

    #[test]
    fn test_inter_layer_reference() {
        let (mut ctx, _pool) = context(Default::default());
        ctx.set_sps(1, sps()).unwrap();

        let base = ctx.set_new_ref(0, &picture(6)).unwrap();
        ctx.finish_frame();
        ctx.set_new_ref(1, &picture(6)).unwrap();

        let hdr = SliceHeader {
            type_: SliceType::P,
            inter_layer_pred_enabled_flag: true,
            num_ref_idx_active: [2, 0],
            ..Default::default()
        };
        ctx.frame_rps(1, &hdr).unwrap();
        assert_eq!(ctx.rps()[RpsType::InterLayer0].get(0).unwrap().slot, base);

        let lists = ctx.slice_rpl(&hdr, 0).unwrap();
        assert_eq!(lists[0].pocs(), vec![6, 6]);
        assert!(lists[0].get(0).unwrap().is_long_term);

        assert!(matches!(
            ctx.frame_rps(0, &hdr),
            Err(Error::InterLayerOnBaseLayer)
        ));
    }

    #[test]
    fn test_collocated_ref() {
        let (mut ctx, _pool) = hierarchy();

        let mut hdr = b_slice(st_rps(&[-2], &[2], &[true, true]), [2, 2]);
        hdr.collocated_list = 1;
        hdr.collocated_ref_idx = 1;
        ctx.frame_rps(0, &hdr).unwrap();
        ctx.slice_rpl(&hdr, 0).unwrap();

        let collocated = ctx.collocated_ref().unwrap();
        assert_eq!(ctx.slot(collocated).unwrap().poc(), 0);
    }

    #[test]
    fn test_per_ctb_lists() {
        let (mut ctx, _pool) = hierarchy();
        let cur = ctx.current_picture().unwrap();

        let first = b_slice(st_rps(&[-2], &[2], &[true, true]), [1, 1]);
        ctx.frame_rps(0, &first).unwrap();
        ctx.slice_rpl(&first, 0).unwrap();

        // The second slice starts at CTB 6 (x = 32, y = 16) and swaps the lists.
        let second = SliceHeader {
            segment_address: 6,
            ..b_slice(st_rps(&[-2], &[2], &[true, true]), [1, 1])
        };
        let second = SliceHeader {
            ref_pic_list_modification_flag: [true, true],
            list_entry: [vec![1], vec![1]],
            ..second
        };
        ctx.slice_rpl(&second, 1).unwrap();

        assert_eq!(ctx.ref_list_at(cur, 0, 0).unwrap()[0].pocs(), vec![0]);
        assert_eq!(ctx.ref_list_at(cur, 16, 16).unwrap()[0].pocs(), vec![0]);
        assert_eq!(ctx.ref_list_at(cur, 32, 16).unwrap()[0].pocs(), vec![4]);
        assert_eq!(ctx.ref_list_at(cur, 63, 31).unwrap()[1].pocs(), vec![0]);

        // Only two slices were announced for this picture.
        assert!(matches!(
            ctx.slice_rpl(&second, 2),
            Err(Error::SliceIndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_frame_nb_refs() {
        let pps = Pps {
            curr_pic_ref_enabled_flag: true,
            ..Default::default()
        };
        let hdr = SliceHeader {
            long_term_ref_pics: LongTermRefPics {
                poc: vec![3, 5],
                used: vec![true, false],
                poc_msb_present: vec![false, false],
            },
            inter_layer_pred_enabled_flag: true,
            ..b_slice(st_rps(&[-1, -2], &[1], &[true, false, true]), [1, 1])
        };

        assert_eq!(frame_nb_refs(&hdr, &pps), 5);
        assert_eq!(frame_nb_refs(&SliceHeader::default(), &Pps::default()), 0);
    }
}
