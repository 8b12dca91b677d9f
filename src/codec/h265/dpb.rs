// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use thiserror::Error;

use crate::codec::h265::params::Pps;
use crate::codec::h265::params::Sps;
use crate::codec::h265::params::MAX_REFS;
use crate::codec::h265::picture::PicStruct;
use crate::codec::h265::picture::Reference;
use crate::codec::h265::picture::SlotFlags;
use crate::codec::h265::picture::SlotStatus;
use crate::video_frame::Frame;
use crate::video_frame::FrameBufferProvider;
use crate::video_frame::FrameProps;
use crate::video_frame::SideData;

#[derive(Debug, Error)]
pub enum DpbError {
    #[error("DPB of layer {0} is full")]
    OutOfSlots(usize),
    #[error("could not acquire a picture buffer")]
    OutOfMemory,
    #[error("slice index {index} exceeds the {len} entries of the picture's list table")]
    SliceIndexOutOfRange { index: usize, len: usize },
}

/// Identifies a slot in the DPB of a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub layer: usize,
    pub index: usize,
}

/// An entry in a reference picture list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefPicListEntry {
    pub poc: i32,
    pub slot: SlotRef,
    pub is_long_term: bool,
}

/// A reference picture list, holding up to `MAX_REFS` entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicList {
    entries: Vec<RefPicListEntry>,
}

impl RefPicList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_REFS
    }

    /// Appends `entry`, unless the list is already full. Returns whether the entry was added.
    pub fn push(&mut self, entry: RefPicListEntry) -> bool {
        if self.is_full() {
            return false;
        }

        self.entries.push(entry);
        true
    }

    pub fn get(&self, idx: usize) -> Option<&RefPicListEntry> {
        self.entries.get(idx)
    }

    pub fn entries(&self) -> &[RefPicListEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [RefPicListEntry] {
        &mut self.entries
    }

    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len)
    }

    pub fn clear(&mut self) {
        self.entries.clear()
    }

    /// The POCs of the entries, in list order.
    pub fn pocs(&self) -> Vec<i32> {
        self.entries.iter().map(|e| e.poc).collect()
    }
}

/// RefPicList0 and RefPicList1 of a slice.
pub type SliceRefLists = [RefPicList; 2];

/// Initial state of a slot being allocated.
#[derive(Clone, Debug, Default)]
pub struct NewSlot {
    pub poc: i32,
    /// Must not be empty, or the slot would be free again right away.
    pub flags: SlotFlags,
    pub pic_struct: PicStruct,
    pub props: FrameProps,
    pub side_data: Vec<SideData>,
    /// Number of entries of the per-picture list table, i.e. how many slices the picture can
    /// have.
    pub num_slices: usize,
    pub pps: Option<Arc<Pps>>,
    /// Slot of the base layer picture in the same access unit, for enhancement layers.
    pub base_layer_frame: Option<usize>,
}

/// A DPB slot. The slot is free when it holds no frame, which is the case exactly when its flags
/// are empty.
#[derive(Clone, Debug, Default)]
pub struct DpbSlot {
    poc: i32,
    flags: SlotFlags,
    frame: Option<Frame>,
    pic_struct: PicStruct,
    props: FrameProps,
    base_layer_frame: Option<usize>,
    pps: Option<Arc<Pps>>,
    /// One pair of lists per slice of the picture.
    ref_lists: Vec<SliceRefLists>,
    /// For each CTB in tile scan order, the index in `ref_lists` of the lists it was decoded
    /// with.
    ctb_lists: Vec<usize>,
    /// The entry of `ref_lists` used by the slice being decoded.
    cur_lists: usize,
}

impl DpbSlot {
    pub fn poc(&self) -> i32 {
        self.poc
    }

    pub fn flags(&self) -> SlotFlags {
        self.flags
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus::from(self.flags)
    }

    pub fn is_free(&self) -> bool {
        self.frame.is_none()
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn pic_struct(&self) -> PicStruct {
        self.pic_struct
    }

    pub fn props(&self) -> FrameProps {
        self.props
    }

    pub fn base_layer_frame(&self) -> Option<usize> {
        self.base_layer_frame
    }

    pub fn pps(&self) -> Option<&Arc<Pps>> {
        self.pps.as_ref()
    }

    /// Makes the CTBs from `first_ctb_ts` onward point at the lists of slice `slice_idx`, and
    /// selects these lists as the current ones.
    pub fn select_slice_lists(
        &mut self,
        slice_idx: usize,
        first_ctb_ts: usize,
    ) -> Result<(), DpbError> {
        if slice_idx >= self.ref_lists.len() {
            return Err(DpbError::SliceIndexOutOfRange {
                index: slice_idx,
                len: self.ref_lists.len(),
            });
        }

        for ctb in self.ctb_lists.iter_mut().skip(first_ctb_ts) {
            *ctb = slice_idx;
        }
        self.cur_lists = slice_idx;

        Ok(())
    }

    /// The lists of the slice currently being decoded.
    pub fn current_ref_lists(&self) -> Option<&SliceRefLists> {
        self.ref_lists.get(self.cur_lists)
    }

    pub fn current_ref_lists_mut(&mut self) -> Option<&mut SliceRefLists> {
        self.ref_lists.get_mut(self.cur_lists)
    }

    /// The lists the CTB at `ctb_addr_ts` was decoded with.
    pub fn ref_lists_at(&self, ctb_addr_ts: usize) -> Option<&SliceRefLists> {
        let idx = *self.ctb_lists.get(ctb_addr_ts)?;
        self.ref_lists.get(idx)
    }

    fn release(&mut self) {
        let poc = self.poc;
        *self = Default::default();
        self.poc = poc;
    }
}

/// The Decoded Picture Buffer of a layer: a fixed number of slots, each of which can hold a
/// picture.
#[derive(Clone, Debug)]
pub struct Dpb {
    layer: usize,
    slots: Vec<DpbSlot>,
}

impl Dpb {
    pub fn new(layer: usize, capacity: usize) -> Self {
        Self {
            layer,
            slots: vec![Default::default(); capacity],
        }
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[DpbSlot] {
        &self.slots
    }

    pub fn slot(&self, idx: usize) -> Option<&DpbSlot> {
        self.slots.get(idx)
    }

    pub fn slot_mut(&mut self, idx: usize) -> Option<&mut DpbSlot> {
        self.slots.get_mut(idx)
    }

    /// Number of slots holding a picture.
    pub fn num_in_use(&self) -> usize {
        self.slots.iter().filter(|s| !s.flags.is_empty()).count()
    }

    /// Whether a picture with `poc` is currently stored.
    pub fn contains_poc(&self, poc: i32) -> bool {
        self.slots.iter().any(|s| !s.is_free() && s.poc == poc)
    }

    /// Finds a free slot, acquires a buffer for it and initializes it from `new`.
    pub fn alloc(
        &mut self,
        provider: &dyn FrameBufferProvider,
        sps: &Sps,
        new: NewSlot,
    ) -> Result<usize, DpbError> {
        debug_assert!(!new.flags.is_empty());

        let Some(idx) = self.slots.iter().position(|s| s.is_free()) else {
            log::error!("Error allocating frame, DPB of layer {} full.", self.layer);
            return Err(DpbError::OutOfSlots(self.layer));
        };

        let frame = provider
            .acquire(sps.format, sps.resolution())
            .ok_or(DpbError::OutOfMemory)?;

        for side_data in new.side_data {
            provider
                .attach_side_data(&frame, side_data)
                .map_err(|e| {
                    log::error!("Failed to attach side data: {:#}", e);
                    DpbError::OutOfMemory
                })?;
        }

        let slot = &mut self.slots[idx];
        *slot = DpbSlot {
            poc: new.poc,
            flags: new.flags,
            frame: Some(frame),
            pic_struct: new.pic_struct,
            props: new.props,
            base_layer_frame: new.base_layer_frame,
            pps: new.pps,
            ref_lists: vec![Default::default(); new.num_slices.max(1)],
            ctb_lists: vec![0; sps.ctb_count()],
            cur_lists: 0,
        };

        log::debug!(
            "Allocated slot {} of layer {} for POC {} ({:?})",
            idx,
            self.layer,
            new.poc,
            new.flags
        );

        Ok(idx)
    }

    /// Finds the picture with `poc`. Unless `use_msb` is set, only the LSBs of the POCs are
    /// compared and the picture with `current_poc` is never returned.
    pub fn find_ref_idx(
        &self,
        poc: i32,
        use_msb: bool,
        log2_max_pic_order_cnt_lsb: u8,
        current_poc: i32,
    ) -> Option<usize> {
        let mask = if use_msb {
            !0
        } else {
            (1 << log2_max_pic_order_cnt_lsb) - 1
        };

        self.slots.iter().position(|s| {
            !s.is_free() && (s.poc & mask) == poc && (use_msb || s.poc != current_poc)
        })
    }

    /// Replaces the reference marking of slot `idx` with `reference`.
    pub fn mark_ref(&mut self, idx: usize, reference: Reference) {
        if let Some(slot) = self.slots.get_mut(idx).filter(|s| !s.is_free()) {
            slot.flags.remove(SlotFlags::REFS);
            slot.flags.insert(reference.flag());

            log::trace!("Set reference of POC {} to {:?}", slot.poc, reference);
        }
    }

    /// Clears `flags` from slot `idx`. The slot is released once no flag remains.
    pub fn unref(&mut self, idx: usize, flags: SlotFlags) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };

        slot.flags.remove(flags);
        if slot.flags.is_empty() && !slot.is_free() {
            log::debug!("Released POC {} from slot {}", slot.poc, idx);
            slot.release();
        }
    }

    /// Marks all pictures as unused for reference.
    pub fn clear_refs(&mut self) {
        for idx in 0..self.slots.len() {
            self.unref(idx, SlotFlags::REFS);
        }
    }

    /// Releases every concealment placeholder.
    pub fn unref_missing_refs(&mut self) {
        for idx in 0..self.slots.len() {
            if self.slots[idx].flags.contains(SlotFlags::UNAVAILABLE) {
                self.unref(idx, SlotFlags::all());
            }
        }
    }

    /// Releases every slot whose flags are empty.
    pub fn release_unused(&mut self) {
        for idx in 0..self.slots.len() {
            self.unref(idx, SlotFlags::empty());
        }
    }

    /// Releases every slot, regardless of its flags.
    pub fn flush(&mut self) {
        log::debug!("Flushing the DPB of layer {}", self.layer);

        for idx in 0..self.slots.len() {
            self.unref(idx, SlotFlags::all());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_frame::FramePool;
    use crate::DecodedFormat;

    fn sps() -> Sps {
        Sps {
            width: 64,
            height: 32,
            format: DecodedFormat::I420,
            log2_ctb_size: 4,
            log2_max_pic_order_cnt_lsb: 4,
            ..Default::default()
        }
    }

    fn new_slot(poc: i32, flags: SlotFlags) -> NewSlot {
        NewSlot {
            poc,
            flags,
            num_slices: 2,
            ..Default::default()
        }
    }

    fn assert_ownership_invariant(dpb: &Dpb) {
        for slot in dpb.slots() {
            assert_eq!(slot.flags().is_empty(), slot.frame().is_none());
        }
    }

    #[test]
    fn test_alloc_and_unref() {
        let pool = FramePool::new();
        let mut dpb = Dpb::new(0, 4);

        let idx = dpb
            .alloc(&pool, &sps(), new_slot(3, SlotFlags::SHORT_REF | SlotFlags::OUTPUT))
            .unwrap();
        assert_eq!(dpb.num_in_use(), 1);
        assert_eq!(pool.outstanding(), 1);
        assert_ownership_invariant(&dpb);

        // Still waiting for output: the buffer must be kept.
        dpb.unref(idx, SlotFlags::SHORT_REF);
        assert_eq!(dpb.slot(idx).unwrap().status(), SlotStatus::PendingOutput);
        assert_eq!(pool.outstanding(), 1);
        assert_ownership_invariant(&dpb);

        dpb.unref(idx, SlotFlags::OUTPUT);
        assert!(dpb.slot(idx).unwrap().is_free());
        assert_eq!(pool.outstanding(), 0);
        assert_ownership_invariant(&dpb);

        // Unreferencing a free slot again is harmless.
        dpb.unref(idx, SlotFlags::all());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_out_of_slots() {
        let pool = FramePool::new();
        let mut dpb = Dpb::new(1, 2);

        dpb.alloc(&pool, &sps(), new_slot(0, SlotFlags::SHORT_REF)).unwrap();
        dpb.alloc(&pool, &sps(), new_slot(1, SlotFlags::SHORT_REF)).unwrap();
        assert!(matches!(
            dpb.alloc(&pool, &sps(), new_slot(2, SlotFlags::SHORT_REF)),
            Err(DpbError::OutOfSlots(1))
        ));
        assert_ownership_invariant(&dpb);
    }

    #[test]
    fn test_out_of_memory_leaves_slot_free() {
        let pool = FramePool::with_budget(1);
        let mut dpb = Dpb::new(0, 4);

        dpb.alloc(&pool, &sps(), new_slot(0, SlotFlags::SHORT_REF)).unwrap();
        assert!(matches!(
            dpb.alloc(&pool, &sps(), new_slot(1, SlotFlags::SHORT_REF)),
            Err(DpbError::OutOfMemory)
        ));
        assert_eq!(dpb.num_in_use(), 1);
        assert_ownership_invariant(&dpb);
    }

    #[test]
    fn test_find_ref_idx() {
        let pool = FramePool::new();
        let mut dpb = Dpb::new(0, 4);

        let a = dpb.alloc(&pool, &sps(), new_slot(18, SlotFlags::SHORT_REF)).unwrap();
        let b = dpb.alloc(&pool, &sps(), new_slot(5, SlotFlags::SHORT_REF)).unwrap();

        // 18 & 0xf == 2.
        assert_eq!(dpb.find_ref_idx(2, false, 4, 5), Some(a));
        assert_eq!(dpb.find_ref_idx(2, true, 4, 5), None);
        assert_eq!(dpb.find_ref_idx(18, true, 4, 5), Some(a));

        // The current picture is only found when the full POC is used.
        assert_eq!(dpb.find_ref_idx(5, false, 4, 5), None);
        assert_eq!(dpb.find_ref_idx(5, true, 4, 5), Some(b));
    }

    #[test]
    fn test_mark_and_clear_refs() {
        let pool = FramePool::new();
        let mut dpb = Dpb::new(0, 4);

        let a = dpb.alloc(&pool, &sps(), new_slot(0, SlotFlags::SHORT_REF)).unwrap();
        let b = dpb
            .alloc(&pool, &sps(), new_slot(1, SlotFlags::SHORT_REF | SlotFlags::OUTPUT))
            .unwrap();

        dpb.mark_ref(a, Reference::LongTerm);
        assert_eq!(dpb.slot(a).unwrap().flags(), SlotFlags::LONG_REF);

        dpb.clear_refs();
        assert!(dpb.slot(a).unwrap().is_free());
        assert_eq!(dpb.slot(b).unwrap().flags(), SlotFlags::OUTPUT);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_unref_missing_refs() {
        let pool = FramePool::new();
        let mut dpb = Dpb::new(0, 4);

        let a = dpb.alloc(&pool, &sps(), new_slot(0, SlotFlags::UNAVAILABLE)).unwrap();
        dpb.mark_ref(a, Reference::ShortTerm);
        let b = dpb.alloc(&pool, &sps(), new_slot(1, SlotFlags::SHORT_REF)).unwrap();

        dpb.unref_missing_refs();
        assert!(dpb.slot(a).unwrap().is_free());
        assert!(!dpb.slot(b).unwrap().is_free());
    }

    #[test]
    fn test_flush() {
        let pool = FramePool::new();
        let mut dpb = Dpb::new(0, 4);

        for poc in 0..4 {
            dpb.alloc(&pool, &sps(), new_slot(poc, SlotFlags::SHORT_REF | SlotFlags::OUTPUT))
                .unwrap();
        }

        dpb.flush();
        assert_eq!(dpb.num_in_use(), 0);
        assert_eq!(pool.outstanding(), 0);
        assert_ownership_invariant(&dpb);
    }

    #[test]
    fn test_slice_lists_per_ctb() {
        let pool = FramePool::new();
        let mut dpb = Dpb::new(0, 4);
        let idx = dpb.alloc(&pool, &sps(), new_slot(0, SlotFlags::SHORT_REF)).unwrap();
        let slot = dpb.slot_mut(idx).unwrap();

        // 64x32 with 16x16 CTBs: 8 CTBs, two slices starting at CTBs 0 and 5.
        slot.select_slice_lists(0, 0).unwrap();
        slot.current_ref_lists_mut().unwrap()[0].push(RefPicListEntry {
            poc: 7,
            slot: SlotRef { layer: 0, index: 3 },
            is_long_term: false,
        });
        slot.select_slice_lists(1, 5).unwrap();
        assert!(slot.current_ref_lists().unwrap()[0].is_empty());

        assert_eq!(slot.ref_lists_at(4).unwrap()[0].pocs(), vec![7]);
        assert!(slot.ref_lists_at(5).unwrap()[0].is_empty());
        assert!(slot.ref_lists_at(8).is_none());
        assert!(matches!(
            slot.select_slice_lists(2, 6),
            Err(DpbError::SliceIndexOutOfRange { index: 2, len: 2 })
        ));
    }
}
