// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output of decoded pictures in presentation order.
//!
//! Pictures waiting for output are bumped out of the DPB once too many of them are pending, or
//! once the DPB is too full. Field pictures are paired and woven into interlaced frames before
//! being pushed to the output queue.
//!
//! The pairing state lives in an [`OutputScheduler`], which is shared by all the contexts of a
//! decoding session, including the ones produced by [`H265Context::duplicate`].

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::anyhow;

use crate::codec::h265::dpb::SlotRef;
use crate::codec::h265::params::MAX_LAYERS;
use crate::codec::h265::picture::PicStruct;
use crate::codec::h265::picture::SlotFlags;
use crate::decoder::h265::H265Context;
use crate::decoder::DecodedPicture;
use crate::decoder::Error;
use crate::decoder::OutputQueue;
use crate::decoder::Result;
use crate::decoder::Threading;
use crate::video_frame::Frame;
use crate::video_frame::FrameBufferProvider;
use crate::video_frame::FrameLayout;
use crate::video_frame::FrameProps;
use crate::Resolution;

/// Counters kept for diagnostic purposes. None of them affects the output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputStats {
    /// Pictures bumped out of the DPB for output.
    pub dpb_counter: u64,
    /// Pictures bumped with a lower POC than the previous one.
    pub dpb_poc_out_of_order: u64,
    /// Pictures pushed to the output queue.
    pub output_counter: u64,
    /// Pictures pushed with a lower POC than the previous one.
    pub output_poc_out_of_order: u64,
    /// Field pictures dropped because they could not be paired.
    pub orphaned_field_pictures: u64,
}

/// A first field waiting for its second field.
struct FieldStash {
    frame: Frame,
    poc: i32,
    pic_struct: PicStruct,
    props: FrameProps,
}

/// A picture bumped out of the DPB.
struct Victim {
    slot: SlotRef,
    frame: Frame,
    poc: i32,
    pic_struct: PicStruct,
    props: FrameProps,
}

enum Pairing {
    /// The field was kept as the first field of a pair.
    Stashed,
    /// The field could not be paired and was dropped.
    Dropped,
    /// The stashed field was dropped, and the field must be considered again.
    Retry,
    /// Both fields were woven into a frame.
    Paired(DecodedPicture),
}

enum Emission {
    Done,
    Retry,
}

enum Bump {
    Continue,
    Deferred,
}

#[derive(Default)]
struct OutputState {
    stats: OutputStats,
    dpb_poc: i32,
    output_poc: i32,
    first_field: Option<FieldStash>,
    /// Scratch frame the fields are woven into. Reused once the client releases it.
    constructed_frame: Option<Frame>,
}

impl OutputState {
    fn record_dpb_pop(&mut self, poc: i32) {
        self.stats.dpb_counter += 1;
        if self.stats.dpb_counter > 1 && poc < self.dpb_poc && poc > 0 {
            self.stats.dpb_poc_out_of_order += 1;
            log::error!(
                "DPB POC out of order: POC {} < previous POC {} (counter={}, out of order={})",
                poc,
                self.dpb_poc,
                self.stats.dpb_counter,
                self.stats.dpb_poc_out_of_order
            );
        }
        self.dpb_poc = poc;
    }

    fn record_output(&mut self, poc: i32) {
        self.stats.output_counter += 1;
        if self.stats.output_counter > 1 && poc < self.output_poc && poc > 0 {
            self.stats.output_poc_out_of_order += 1;
            log::error!(
                "Output POC out of order: POC {} < previous POC {} (counter={}, out of order={})",
                poc,
                self.output_poc,
                self.stats.output_counter,
                self.stats.output_poc_out_of_order
            );
        }
        self.output_poc = poc;
    }

    fn orphan(&mut self, count: u64) {
        self.stats.orphaned_field_pictures += count;
    }

    /// Outputs `victim`, pairing it with the stashed field if it is a field picture.
    fn emit(
        &mut self,
        victim: Victim,
        provider: &dyn FrameBufferProvider,
        queue: &OutputQueue,
        pkt_dts: Option<i64>,
    ) -> Result<Emission> {
        self.record_dpb_pop(victim.poc);

        let picture = if victim.pic_struct.is_field_picture() {
            match self.pair_field(victim, provider)? {
                Pairing::Paired(picture) => picture,
                Pairing::Retry => return Ok(Emission::Retry),
                Pairing::Stashed | Pairing::Dropped => return Ok(Emission::Done),
            }
        } else {
            if let Some(stash) = self.first_field.take() {
                log::error!("Discarded orphaned first field picture POC {}", stash.poc);
                self.orphan(1);
            }

            DecodedPicture {
                frame: victim.frame,
                poc: victim.poc,
                layer: victim.slot.layer,
                pic_struct: victim.pic_struct,
                props: victim.props,
                pkt_dts: None,
            }
        };

        let picture = DecodedPicture { pkt_dts, ..picture };
        log::debug!(
            "Output POC {} of layer {}: {:?}, interlaced={} tff={} dts={:?}",
            picture.poc,
            picture.layer,
            picture.pic_struct,
            picture.props.interlaced,
            picture.props.top_field_first,
            picture.pkt_dts
        );

        self.record_output(picture.poc);
        queue.push(picture)?;

        Ok(Emission::Done)
    }

    fn pair_field(&mut self, victim: Victim, provider: &dyn FrameBufferProvider) -> Result<Pairing> {
        let layer = victim.slot.layer;
        let poc = victim.poc;
        let pic_struct = victim.pic_struct;
        let even = poc % 2 == 0;

        // Without explicit pairing, an even POC starts a new pair.
        let is_first = (pic_struct.is_tff() && pic_struct.is_top_field())
            || (pic_struct.is_bff() && pic_struct.is_bottom_field())
            || match &self.first_field {
                None => even,
                Some(first) => first.pic_struct == pic_struct && even && poc > first.poc,
            };

        let field = FieldStash {
            frame: victim.frame,
            poc,
            pic_struct,
            props: victim.props,
        };

        if is_first {
            log::debug!("Found first field picture POC {}", poc);
            if let Some(orphan) = self.first_field.replace(field) {
                log::error!("Discarded orphaned first field with POC {}", orphan.poc);
                self.orphan(1);
            }
            return Ok(Pairing::Stashed);
        }

        let Some(first) = self.first_field.take() else {
            log::error!("Discarded orphaned second field picture with POC {}", poc);
            self.orphan(1);
            return Ok(Pairing::Dropped);
        };

        if first.frame.layout() != field.frame.layout() {
            self.orphan(1);
            if even {
                log::error!("Discarded orphaned first field picture POC {}", first.poc);
                return Ok(Pairing::Retry);
            }

            log::error!(
                "Discarded mismatched field pictures POCs: {} {}",
                first.poc,
                poc
            );
            return Ok(Pairing::Dropped);
        }

        let (top, bottom) = if pic_struct.is_top_field() {
            (&field, &first)
        } else {
            (&first, &field)
        };

        let frame = match self.weave(&top.frame, &bottom.frame, provider) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!(
                    "Interlaced frame construction failure POCs: {} {}",
                    top.poc,
                    bottom.poc
                );
                self.orphan(2);
                return Err(e);
            }
        };

        // A woven frame lasts two field periods.
        let timed = [first.props.duration, field.props.duration]
            .iter()
            .any(|d| d.is_some_and(|d| d > 0));
        let duration = if timed {
            field.props.duration.map(|d| d * 2)
        } else {
            top.props.duration
        };

        Ok(Pairing::Paired(DecodedPicture {
            frame,
            poc: first.poc,
            layer,
            pic_struct: first.pic_struct,
            props: FrameProps {
                interlaced: true,
                top_field_first: !first.pic_struct.is_bottom_field(),
                duration,
                ..top.props
            },
            pkt_dts: None,
        }))
    }

    /// Weaves `top` into the even lines and `bottom` into the odd lines of a frame twice as
    /// tall.
    fn weave(
        &mut self,
        top: &Frame,
        bottom: &Frame,
        provider: &dyn FrameBufferProvider,
    ) -> Result<Frame> {
        let size = Resolution {
            width: top.resolution().width,
            height: top.resolution().height * 2,
        };
        let layout = FrameLayout::new(top.format(), size);

        let frame = match self.constructed_frame.take() {
            Some(frame) if frame.is_unique() && *frame.layout() == layout => frame,
            _ => provider
                .acquire(layout.format, layout.size)
                .ok_or(Error::OutOfMemory)?,
        };

        {
            let dst_layout = frame.layout();
            let mut dst_planes = frame.planes_mut();

            for (parity, field) in [top, bottom].into_iter().enumerate() {
                let src_planes = field.planes();

                for (plane, (dst, src)) in dst_planes.iter_mut().zip(src_planes.iter()).enumerate()
                {
                    let (Some(dst_geom), Some(src_geom)) = (
                        dst_layout.planes.get(plane),
                        field.layout().planes.get(plane),
                    ) else {
                        continue;
                    };
                    if src_geom.pitch == 0 {
                        continue;
                    }

                    let len = src_geom.pitch.min(dst_geom.pitch);
                    for (row, line) in src.chunks_exact(src_geom.pitch).enumerate() {
                        let dst_row = 2 * row + parity;
                        if dst_row >= dst_geom.rows {
                            break;
                        }

                        let start = dst_row * dst_geom.pitch;
                        dst[start..start + len].copy_from_slice(&line[..len]);
                    }
                }
            }
        }

        frame.clear_side_data();
        for side_data in bottom.side_data() {
            frame.add_side_data(side_data);
        }
        frame.progress().mark_produced();

        self.constructed_frame = Some(frame.clone());

        Ok(frame)
    }
}

impl Drop for OutputState {
    fn drop(&mut self) {
        if self.stats.dpb_counter > 0 {
            log::info!(
                "Output summary: DPB counter={} POC out of order={} orphaned fields={}, \
                 output counter={} POC out of order={}",
                self.stats.dpb_counter,
                self.stats.dpb_poc_out_of_order,
                self.stats.orphaned_field_pictures,
                self.stats.output_counter,
                self.stats.output_poc_out_of_order
            );
        }
    }
}

/// Field pairing and output telemetry state shared by all the contexts of a session.
///
/// Cloning the scheduler produces a new handle to the same state. The state is torn down when
/// the last handle is dropped.
#[derive(Clone, Default)]
pub struct OutputScheduler(Arc<Mutex<OutputState>>);

impl OutputScheduler {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, OutputState>> {
        self.0
            .lock()
            .map_err(|_| Error::Other(anyhow!("output scheduler lock poisoned")))
    }

    /// Number of handles to this scheduler.
    pub fn sharers(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn stats(&self) -> Result<OutputStats> {
        Ok(self.lock()?.stats)
    }

    /// Whether a first field is waiting for its second field.
    pub fn has_first_field(&self) -> Result<bool> {
        Ok(self.lock()?.first_field.is_some())
    }

    /// Drops the stashed first field, if any, counting it as orphaned. Returns whether a field
    /// was dropped.
    pub fn discard_first_field(&self) -> Result<bool> {
        let mut state = self.lock()?;

        match state.first_field.take() {
            Some(stash) => {
                log::error!("Discarded orphaned first field picture POC {}", stash.poc);
                state.orphan(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Debug for OutputScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputScheduler")
            .field("sharers", &self.sharers())
            .field("stats", &self.stats().ok())
            .finish()
    }
}

impl H265Context {
    /// Outputs pictures until at most `max_output` access units are waiting for output and no
    /// layer holds more than `max_dpb` pictures.
    ///
    /// Only the layers set in `layers_active_decode` are considered. Pictures of layers not set
    /// in `layers_active_output` are released without being output, as are all pictures if
    /// `discard` is set.
    pub fn output_frames(
        &mut self,
        layers_active_decode: u32,
        layers_active_output: u32,
        max_output: usize,
        max_dpb: usize,
        discard: bool,
    ) -> Result<()> {
        loop {
            let mut nb_dpb = [0usize; MAX_LAYERS];
            let mut nb_output = 0;
            let mut min: Option<(SlotRef, i32)> = None;

            for (layer, ctx) in self.layers.iter().enumerate() {
                if layers_active_decode & (1 << layer) == 0 {
                    continue;
                }

                for (index, slot) in ctx.dpb.slots().iter().enumerate() {
                    if slot.flags().contains(SlotFlags::OUTPUT) {
                        // Count access units, not pictures.
                        let base_pending = slot
                            .base_layer_frame()
                            .and_then(|idx| self.layers[0].dpb.slot(idx))
                            .is_some_and(|base| base.flags().contains(SlotFlags::OUTPUT));
                        if !base_pending {
                            nb_output += 1;
                        }

                        if min.map_or(true, |(_, poc)| slot.poc() < poc) {
                            min = Some((SlotRef { layer, index }, slot.poc()));
                        }
                    }

                    if !slot.flags().is_empty() {
                        nb_dpb[layer] += 1;
                    }
                }
            }

            let bump = nb_output > max_output
                || (nb_output > 0 && nb_dpb.iter().any(|&n| n > max_dpb));
            let Some((victim, _)) = min.filter(|_| bump) else {
                return Ok(());
            };

            if let Bump::Deferred = self.bump(victim, layers_active_output, discard)? {
                return Ok(());
            }
        }
    }

    fn bump(&mut self, victim: SlotRef, layers_active_output: u32, discard: bool) -> Result<Bump> {
        let slot = self
            .slot(victim)
            .ok_or_else(|| Error::Other(anyhow!("invalid DPB slot {:?}", victim)))?;
        let frame = slot
            .frame()
            .cloned()
            .ok_or_else(|| Error::Other(anyhow!("slot {:?} has no frame", victim)))?;

        let poc = slot.poc();
        let pic_struct = slot.pic_struct();
        let props = slot.props();
        let output = !discard && layers_active_output & (1 << victim.layer) != 0;

        let mut aborted = frame.progress().is_cancelled();
        if pic_struct.is_field_picture() {
            if self.decoding && poc == self.poc {
                // Our own picture: it must be completely decoded before it can be paired.
                log::debug!("Scheduling POC {} for the next pass", poc);
                return Ok(Bump::Deferred);
            }

            if self.config.threading == Threading::Frame {
                log::debug!("Waiting on POC {}", poc);
                aborted = !frame.progress().await_produced();
            }
        }

        if aborted {
            // Never produced, so there is nothing to show.
            log::error!("Dropped POC {}/{}, its decoding was cancelled", victim.layer, poc);
            if output && pic_struct.is_field_picture() {
                self.output.lock()?.orphan(1);
            }
            self.layers[victim.layer]
                .dpb
                .unref(victim.index, SlotFlags::OUTPUT);

            return Ok(Bump::Continue);
        }

        let emitted = if output {
            let victim = Victim {
                slot: victim,
                frame,
                poc,
                pic_struct,
                props,
            };
            self.output.lock().and_then(|mut state| {
                state.emit(victim, self.provider.as_ref(), &self.queue, self.pkt_dts)
            })
        } else {
            Ok(Emission::Done)
        };

        if let Ok(Emission::Retry) = emitted {
            return Ok(Bump::Continue);
        }

        self.layers[victim.layer]
            .dpb
            .unref(victim.index, SlotFlags::OUTPUT);
        emitted?;

        log::debug!(
            "{} frame with POC {}/{}",
            if output { "Output" } else { "Discarded" },
            victim.layer,
            poc
        );

        Ok(Bump::Continue)
    }

    /// Drains every pending picture, then releases all the pictures of the DPB.
    ///
    /// The picture still being decoded is dropped without being output. A first field still
    /// waiting for its second field is dropped too.
    pub fn flush_all(&mut self) -> Result<()> {
        if self.decoding {
            if let Some(cur) = self.cur {
                log::debug!("Dropping POC {}, it is still being decoded", self.poc);
                self.layers[cur.layer].dpb.unref(cur.index, SlotFlags::OUTPUT);
            }
        }
        self.abort_current();

        let drained = self.output_frames(
            (1 << MAX_LAYERS) - 1,
            self.config.output_layers,
            0,
            0,
            false,
        );

        self.flush_dpb();
        let discarded = self.output.discard_first_field();

        drained?;
        discarded?;

        Ok(())
    }
}
