// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture storage shared between the DPB, the decoding workers and the output queue.
//!
//! A [`Frame`] is a reference-counted handle: cloning it shares the same pixel storage, the same
//! side data and the same [`Progress`] tracker. The storage is released when the last handle is
//! dropped.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::utils::align_up;
use crate::DecodedFormat;
use crate::Resolution;

pub mod frame_pool;

pub use frame_pool::FramePool;

pub const Y_PLANE: usize = 0;
pub const U_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

/// Geometry of a single plane. Pitch is measured in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub pitch: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn size(&self) -> usize {
        self.pitch * self.rows
    }
}

/// Memory layout of a frame: its format, visible size and the geometry of each plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub format: DecodedFormat,
    pub size: Resolution,
    pub planes: Vec<PlaneLayout>,
}

impl FrameLayout {
    /// Computes the unpadded layout of a `format` frame of `size`.
    pub fn new(format: DecodedFormat, size: Resolution) -> Self {
        let planes = (0..format.num_planes())
            .map(|plane| {
                let hsub = format.horizontal_subsampling(plane);
                let vsub = format.vertical_subsampling(plane);

                PlaneLayout {
                    pitch: align_up(size.width as usize, hsub) / hsub
                        * format.bytes_per_element(plane),
                    rows: align_up(size.height as usize, vsub) / vsub,
                }
            })
            .collect();

        Self {
            format,
            size,
            planes,
        }
    }
}

/// Which view of a stereoscopic pair a frame belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StereoView {
    Left,
    Right,
    Unspecified,
}

/// Metadata attached to a frame alongside its pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SideData {
    /// The view the frame belongs to in a multi-layer stream.
    ViewId(u32),
    /// Frame-sequential stereoscopic 3D tagging.
    Stereo3d { view: StereoView },
}

/// Cropping to apply to the coded picture for display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CropWindow {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// Display properties of a picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameProps {
    pub interlaced: bool,
    pub top_field_first: bool,
    /// Number of extra field periods the picture should be displayed for.
    pub repeat_pict: u8,
    pub crop: CropWindow,
    /// Display duration, in the time base of the packets the picture was decoded from.
    pub duration: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProgressState {
    Pending,
    Produced,
    Cancelled,
}

/// Tracks whether the pixels of a frame have been completely produced by the worker decoding it.
///
/// Other workers can block on [`Progress::await_produced`] until that happens. Waits are not
/// bounded in time, and only end when the frame is produced or the wait is cancelled because the
/// stream is being torn down.
#[derive(Debug)]
pub struct Progress {
    state: Mutex<ProgressState>,
    cond: Condvar,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: Mutex::new(ProgressState::Pending),
            cond: Condvar::new(),
        }
    }
}

impl Progress {
    fn set(&self, new_state: ProgressState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ProgressState::Pending {
            *state = new_state;
        }
        self.cond.notify_all();
    }

    /// Reports that the frame is fully produced and wakes up all waiters.
    pub fn mark_produced(&self) {
        self.set(ProgressState::Produced)
    }

    /// Wakes up all waiters without the frame being produced.
    pub fn cancel(&self) {
        self.set(ProgressState::Cancelled)
    }

    pub fn is_produced(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == ProgressState::Produced
    }

    /// Whether the frame will never be produced.
    pub fn is_cancelled(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == ProgressState::Cancelled
    }

    /// Blocks until the frame is produced or the wait is cancelled. Returns `true` if the frame
    /// has been produced.
    pub fn await_produced(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .cond
            .wait_while(state, |s| *s == ProgressState::Pending)
            .unwrap_or_else(PoisonError::into_inner);

        *state == ProgressState::Produced
    }
}

/// Releases the budget taken by a frame from its pool when the frame's storage is freed.
pub(crate) type ReleaseCallback = Box<dyn FnOnce() + Send + Sync>;

struct FrameInner {
    layout: FrameLayout,
    planes: RwLock<Vec<Vec<u8>>>,
    side_data: Mutex<Vec<SideData>>,
    progress: Progress,
    on_release: Option<ReleaseCallback>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

/// Shared handle to picture storage.
#[derive(Clone)]
pub struct Frame(Arc<FrameInner>);

impl Frame {
    /// Allocates zeroed storage for `layout`.
    pub fn new(layout: FrameLayout) -> Self {
        Self::with_release(layout, None)
    }

    pub(crate) fn with_release(layout: FrameLayout, on_release: Option<ReleaseCallback>) -> Self {
        let planes = layout
            .planes
            .iter()
            .map(|plane| vec![0u8; plane.size()])
            .collect();

        Self(Arc::new(FrameInner {
            layout,
            planes: RwLock::new(planes),
            side_data: Default::default(),
            progress: Default::default(),
            on_release,
        }))
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.0.layout
    }

    pub fn format(&self) -> DecodedFormat {
        self.0.layout.format
    }

    pub fn resolution(&self) -> Resolution {
        self.0.layout.size
    }

    /// Maps the planes for reading.
    pub fn planes(&self) -> RwLockReadGuard<'_, Vec<Vec<u8>>> {
        self.0.planes.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maps the planes for writing.
    pub fn planes_mut(&self) -> RwLockWriteGuard<'_, Vec<Vec<u8>>> {
        self.0.planes.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn side_data(&self) -> Vec<SideData> {
        self.0
            .side_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_side_data(&self, side_data: SideData) {
        self.0
            .side_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(side_data);
    }

    pub fn clear_side_data(&self) {
        self.0
            .side_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn progress(&self) -> &Progress {
        &self.0.progress
    }

    /// Whether `self` and `other` share the same storage.
    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether this is the only handle to the storage.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("layout", &self.0.layout)
            .field("produced", &self.0.progress.is_produced())
            .finish()
    }
}

/// Source of picture storage for the DPB.
pub trait FrameBufferProvider: Send + Sync {
    /// Acquires a buffer able to hold a `format` picture of `size`. Returns `None` if the memory
    /// could not be obtained.
    fn acquire(&self, format: DecodedFormat, size: Resolution) -> Option<Frame>;

    /// Attaches `side_data` to `frame`.
    fn attach_side_data(&self, frame: &Frame, side_data: SideData) -> anyhow::Result<()> {
        frame.add_side_data(side_data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_nv12_layout() {
        let layout = FrameLayout::new(DecodedFormat::NV12, Resolution::from((63, 31)));

        assert_eq!(
            layout.planes,
            vec![
                PlaneLayout { pitch: 63, rows: 31 },
                PlaneLayout { pitch: 64, rows: 16 },
            ]
        );
    }

    #[test]
    fn test_i010_layout() {
        let layout = FrameLayout::new(DecodedFormat::I010, Resolution::from((64, 32)));

        assert_eq!(layout.planes.len(), 3);
        assert_eq!(layout.planes[Y_PLANE], PlaneLayout { pitch: 128, rows: 32 });
        assert_eq!(layout.planes[U_PLANE], PlaneLayout { pitch: 64, rows: 16 });
        assert_eq!(layout.planes[V_PLANE], PlaneLayout { pitch: 64, rows: 16 });
    }

    #[test]
    fn test_frame_is_shared() {
        let frame = Frame::new(FrameLayout::new(DecodedFormat::I420, Resolution::from((4, 4))));
        let clone = frame.clone();

        assert!(!frame.is_unique());
        clone.planes_mut()[Y_PLANE][0] = 42;
        assert_eq!(frame.planes()[Y_PLANE][0], 42);
        assert!(frame.ptr_eq(&clone));

        drop(clone);
        assert!(frame.is_unique());
    }

    #[test]
    fn test_progress_wakes_waiter() {
        let frame = Frame::new(FrameLayout::new(DecodedFormat::I420, Resolution::from((4, 4))));
        let worker_frame = frame.clone();

        let waiter = thread::spawn(move || worker_frame.progress().await_produced());
        frame.progress().mark_produced();

        assert!(waiter.join().unwrap());
        assert!(frame.progress().is_produced());
    }

    #[test]
    fn test_progress_cancel() {
        let progress = Arc::new(Progress::default());
        let waiter_progress = Arc::clone(&progress);

        let waiter = thread::spawn(move || waiter_progress.await_produced());
        progress.cancel();

        assert!(!waiter.join().unwrap());
        assert!(progress.is_cancelled());
        // A cancelled wait cannot be turned into a produced frame afterwards.
        progress.mark_produced();
        assert!(!progress.is_produced());
    }
}
