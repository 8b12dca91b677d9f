// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::video_frame::Frame;
use crate::video_frame::FrameBufferProvider;
use crate::video_frame::FrameLayout;
use crate::DecodedFormat;
use crate::Resolution;

/// Heap-backed [`FrameBufferProvider`].
///
/// The pool can be given a budget, i.e. a maximum number of frames that may be alive at the
/// same time. Acquiring a frame past that budget fails, the same way a hardware pool would when
/// running out of surfaces.
#[derive(Debug, Default)]
pub struct FramePool {
    budget: Option<usize>,
    outstanding: Arc<AtomicUsize>,
}

impl FramePool {
    /// Creates a pool without any limit on the number of frames.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a pool that hands out at most `budget` frames at the same time.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            outstanding: Default::default(),
        }
    }

    /// Number of frames currently alive.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn budget(&self) -> Option<usize> {
        self.budget
    }
}

impl FrameBufferProvider for FramePool {
    fn acquire(&self, format: DecodedFormat, size: Resolution) -> Option<Frame> {
        let budget = self.budget.unwrap_or(usize::MAX);
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < budget).then_some(n + 1)
            })
            .ok()?;

        let outstanding = Arc::clone(&self.outstanding);
        let on_release = Box::new(move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        });

        Some(Frame::with_release(
            FrameLayout::new(format, size),
            Some(on_release),
        ))
    }
}
