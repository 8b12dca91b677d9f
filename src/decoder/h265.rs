// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture management of an H.265 decoding session.
//!
//! [`H265Context`] owns the DPB of every layer and drives the three processes acting on it:
//! allocation of the current picture ([`H265Context::set_new_ref`]), derivation of the reference
//! picture set and of the per-slice reference picture lists (see the `rps` module), and output
//! in presentation order (see the `output` module).

pub mod output;
pub mod rps;

use std::sync::Arc;

use anyhow::anyhow;

use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::DpbSlot;
use crate::codec::h265::dpb::NewSlot;
use crate::codec::h265::dpb::SliceRefLists;
use crate::codec::h265::dpb::SlotRef;
use crate::codec::h265::params::NaluType;
use crate::codec::h265::params::Pps;
use crate::codec::h265::params::SeiState;
use crate::codec::h265::params::Sps;
use crate::codec::h265::params::Vps;
use crate::codec::h265::params::MAX_DPB_SIZE;
use crate::codec::h265::params::MAX_LAYERS;
use crate::codec::h265::picture::SlotFlags;
use crate::decoder::h265::output::OutputScheduler;
use crate::decoder::h265::rps::RefPicSets;
use crate::decoder::Error;
use crate::decoder::OutputQueue;
use crate::decoder::Result;
use crate::decoder::Threading;
use crate::video_frame::FrameBufferProvider;
use crate::video_frame::FrameProps;
use crate::video_frame::SideData;
use crate::video_frame::StereoView;

/// Configuration of an [`H265Context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H265ContextConfig {
    pub threading: Threading,
    /// Pictures live in hardware accelerator memory, so placeholders for missing references are
    /// not filled in software.
    pub hwaccel: bool,
    /// Number of slots in the DPB of each layer. Clamped to `1..=MAX_DPB_SIZE`.
    pub dpb_capacity: usize,
    pub output_queue_capacity: usize,
    /// Bitmask of the layers whose pictures are output when the session is drained.
    pub output_layers: u32,
}

impl Default for H265ContextConfig {
    fn default() -> Self {
        Self {
            threading: Default::default(),
            hwaccel: false,
            dpb_capacity: MAX_DPB_SIZE,
            output_queue_capacity: 32,
            output_layers: (1 << MAX_LAYERS) - 1,
        }
    }
}

/// Per-picture information needed to allocate its DPB slot.
#[derive(Debug, Clone)]
pub struct PictureInfo {
    pub poc: i32,
    pub nalu_type: NaluType,
    pub pic_output_flag: bool,
    /// Number of NAL units in the access unit, bounding the number of slices of the picture.
    pub num_slices: usize,
    pub pps: Arc<Pps>,
}

#[derive(Clone, Debug)]
struct LayerContext {
    sps: Option<Arc<Sps>>,
    dpb: Dpb,
    /// Slot of the picture being decoded in this layer.
    cur_frame: Option<usize>,
}

pub struct H265Context {
    config: H265ContextConfig,
    provider: Arc<dyn FrameBufferProvider>,
    vps: Vps,
    sei: SeiState,
    layers: [LayerContext; MAX_LAYERS],

    /// The picture being decoded.
    cur: Option<SlotRef>,
    poc: i32,
    nalu_type: NaluType,
    pps: Option<Arc<Pps>>,
    num_slices: usize,
    /// Whether `cur` is still being produced.
    decoding: bool,
    /// Whether `cur` was allocated by this context rather than inherited from the context it
    /// was duplicated from.
    owns_current: bool,

    rps: RefPicSets,
    collocated_ref: Option<SlotRef>,
    pkt_dts: Option<i64>,
    pkt_duration: Option<i64>,

    output: OutputScheduler,
    queue: OutputQueue,
}

impl H265Context {
    pub fn new(config: H265ContextConfig, provider: Arc<dyn FrameBufferProvider>) -> Self {
        let capacity = config.dpb_capacity.clamp(1, MAX_DPB_SIZE);
        let queue = OutputQueue::new(config.output_queue_capacity);

        Self {
            layers: std::array::from_fn(|layer| LayerContext {
                sps: None,
                dpb: Dpb::new(layer, capacity),
                cur_frame: None,
            }),
            config,
            provider,
            vps: Default::default(),
            sei: Default::default(),
            cur: None,
            poc: 0,
            nalu_type: Default::default(),
            pps: None,
            num_slices: 1,
            decoding: false,
            owns_current: false,
            rps: Default::default(),
            collocated_ref: None,
            pkt_dts: None,
            pkt_duration: None,
            output: OutputScheduler::new(),
            queue,
        }
    }

    /// Creates a new context sharing the output scheduler and output queue of `self`, and
    /// holding its own handles to the pictures currently in the DPB.
    ///
    /// The picture `self` is decoding remains owned by `self`: the new context never completes
    /// nor cancels it.
    pub fn duplicate(&self) -> Self {
        let dup = Self {
            config: self.config.clone(),
            provider: Arc::clone(&self.provider),
            vps: self.vps.clone(),
            sei: self.sei.clone(),
            layers: self.layers.clone(),
            cur: self.cur,
            poc: self.poc,
            nalu_type: self.nalu_type,
            pps: self.pps.clone(),
            num_slices: self.num_slices,
            decoding: self.decoding,
            owns_current: false,
            rps: self.rps.clone(),
            collocated_ref: self.collocated_ref,
            pkt_dts: self.pkt_dts,
            pkt_duration: self.pkt_duration,
            output: self.output.clone(),
            queue: self.queue.clone(),
        };

        log::debug!(
            "Duplicated context, output scheduler now has {} sharers",
            dup.output.sharers()
        );

        dup
    }

    pub fn config(&self) -> &H265ContextConfig {
        &self.config
    }

    pub fn set_vps(&mut self, vps: Vps) {
        self.vps = vps;
    }

    pub fn set_sps(&mut self, layer: usize, sps: Arc<Sps>) -> Result<()> {
        self.layer_mut(layer)?.sps = Some(sps);
        Ok(())
    }

    /// Sets the SEI state applying to the next pictures.
    pub fn set_sei(&mut self, sei: SeiState) {
        self.sei = sei;
    }

    /// Sets the decoding timestamp of the packet being processed.
    pub fn set_packet_dts(&mut self, pkt_dts: Option<i64>) {
        self.pkt_dts = pkt_dts;
    }

    /// Sets the duration of the packet being processed, carried by the pictures it produces.
    pub fn set_packet_duration(&mut self, pkt_duration: Option<i64>) {
        self.pkt_duration = pkt_duration;
    }

    pub fn dpb(&self, layer: usize) -> Option<&Dpb> {
        self.layers.get(layer).map(|l| &l.dpb)
    }

    pub fn slot(&self, slot: SlotRef) -> Option<&DpbSlot> {
        self.layers.get(slot.layer)?.dpb.slot(slot.index)
    }

    /// The picture being decoded.
    pub fn current_picture(&self) -> Option<SlotRef> {
        self.cur
    }

    /// POC of the picture being decoded.
    pub fn poc(&self) -> i32 {
        self.poc
    }

    /// The collocated picture selected by the last slice, used for temporal motion vector
    /// prediction.
    pub fn collocated_ref(&self) -> Option<SlotRef> {
        self.collocated_ref
    }

    pub fn output_scheduler(&self) -> &OutputScheduler {
        &self.output
    }

    pub fn output_queue(&self) -> &OutputQueue {
        &self.queue
    }

    fn layer_mut(&mut self, layer: usize) -> Result<&mut LayerContext> {
        self.layers
            .get_mut(layer)
            .ok_or_else(|| Error::Other(anyhow!("invalid layer {}", layer)))
    }

    fn layer_sps(&self, layer: usize) -> Result<Arc<Sps>> {
        self.layers
            .get(layer)
            .and_then(|l| l.sps.clone())
            .ok_or_else(|| Error::Other(anyhow!("no active SPS for layer {}", layer)))
    }

    fn slot_mut(&mut self, slot: SlotRef) -> Result<&mut DpbSlot> {
        self.layer_mut(slot.layer)?
            .dpb
            .slot_mut(slot.index)
            .ok_or_else(|| Error::Other(anyhow!("invalid DPB slot {:?}", slot)))
    }

    /// Describes a picture of `layer` allocated with the current SEI and stream parameters.
    fn new_slot(&self, layer: usize, sps: &Sps, poc: i32, flags: SlotFlags) -> NewSlot {
        let pic_struct = self.sei.pic_struct;
        let view_id = self.vps.view_id.get(layer).copied().unwrap_or(0);

        let mut side_data = vec![];
        if self.vps.num_layers > 1 || view_id != 0 {
            side_data.push(SideData::ViewId(view_id));

            if let Some(displays) = &self.sei.ref_displays {
                let view = if displays.left_view_id == view_id {
                    StereoView::Left
                } else if displays.right_view_id == view_id {
                    StereoView::Right
                } else {
                    StereoView::Unspecified
                };
                side_data.push(SideData::Stereo3d { view });
            }
        }

        NewSlot {
            poc,
            flags,
            pic_struct,
            props: FrameProps {
                interlaced: pic_struct.is_interlaced(),
                top_field_first: pic_struct.is_interlaced() && pic_struct.is_tff(),
                repeat_pict: pic_struct.repeat_pict(),
                crop: sps.output_window,
                duration: self.pkt_duration,
            },
            side_data,
            num_slices: self.num_slices,
            pps: self.pps.clone(),
            base_layer_frame: None,
        }
    }

    /// Allocates the slot of a new picture of `layer` and makes it the current picture.
    pub fn set_new_ref(&mut self, layer: usize, info: &PictureInfo) -> Result<SlotRef> {
        let sps = self.layer_sps(layer)?;

        if self.layers[layer].dpb.contains_poc(info.poc) {
            log::error!("Duplicate POC in a sequence: {}", info.poc);
            return Err(Error::DuplicatePoc {
                layer,
                poc: info.poc,
            });
        }

        self.poc = info.poc;
        self.nalu_type = info.nalu_type;
        self.pps = Some(Arc::clone(&info.pps));
        self.num_slices = info.num_slices;

        let mut flags = SlotFlags::SHORT_REF;
        if info.pic_output_flag {
            flags |= SlotFlags::OUTPUT;
        }

        let mut new = self.new_slot(layer, &sps, info.poc, flags);
        if layer != 0 {
            new.base_layer_frame = self.layers[0].cur_frame;
        }

        let index = self.layers[layer]
            .dpb
            .alloc(self.provider.as_ref(), &sps, new)?;

        let cur = SlotRef { layer, index };
        self.layers[layer].cur_frame = Some(index);
        self.cur = Some(cur);
        self.collocated_ref = None;
        self.decoding = true;
        self.owns_current = true;

        log::debug!("New picture POC {} in slot {:?}", info.poc, cur);

        Ok(cur)
    }

    /// Reports that all the samples of the current picture have been produced.
    pub fn finish_frame(&mut self) {
        if self.owns_current {
            if let Some(frame) = self.cur.and_then(|cur| self.slot(cur)).and_then(|s| s.frame()) {
                frame.progress().mark_produced();
            }
        }
        self.decoding = false;
    }

    /// Gives up on the current picture. Workers waiting on it are woken up if this context was
    /// the one producing it.
    pub(crate) fn abort_current(&mut self) {
        if self.decoding && self.owns_current {
            if let Some(frame) = self.cur.and_then(|cur| self.slot(cur)).and_then(|s| s.frame()) {
                log::debug!("Cancelled POC {}", self.poc);
                frame.progress().cancel();
            }
        }
        self.decoding = false;
        self.owns_current = false;
    }

    /// Returns the reference picture lists the CTB covering luma position (`x0`, `y0`) of
    /// picture `slot` was decoded with.
    pub fn ref_list_at(&self, slot: SlotRef, x0: u32, y0: u32) -> Option<&SliceRefLists> {
        let layer = self.layers.get(slot.layer)?;
        let sps = layer.sps.as_ref()?;
        let pic = layer.dpb.slot(slot.index)?;
        let pps = pic.pps()?;

        let ctb_addr_rs = (y0 >> sps.log2_ctb_size) as usize * sps.ctb_width()
            + (x0 >> sps.log2_ctb_size) as usize;

        pic.ref_lists_at(pps.ctb_addr_rs_to_ts(ctb_addr_rs))
    }

    /// Marks all the pictures of `layer` as unused for reference.
    pub fn clear_refs(&mut self, layer: usize) -> Result<()> {
        self.layer_mut(layer)?.dpb.clear_refs();
        Ok(())
    }

    /// Releases every picture of every layer, whatever its state.
    ///
    /// If this context was producing the current picture, workers waiting on it are woken up.
    /// Pictures produced by other contexts are left alone.
    pub fn flush_dpb(&mut self) {
        self.abort_current();

        for layer in self.layers.iter_mut() {
            layer.dpb.flush();
            layer.cur_frame = None;
        }

        self.cur = None;
        self.collocated_ref = None;
    }
}
