// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h265;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use thiserror::Error;

use crate::codec::h265::dpb::DpbError;
use crate::codec::h265::picture::PicStruct;
use crate::video_frame::Frame;
use crate::video_frame::FrameProps;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("POC {poc} is already present in the DPB of layer {layer}")]
    DuplicatePoc { layer: usize, poc: i32 },
    #[error("reference index {idx} is out of range for {len} candidates")]
    InvalidReferenceIndex { idx: usize, len: usize },
    #[error("slice has zero reference pictures")]
    ZeroReferences,
    #[error("reference with POC {poc} is missing or is the current picture")]
    DuplicateOrMissingReference { poc: i32 },
    #[error("slice index {index} exceeds the {len} entries of the picture's list table")]
    SliceIndexOutOfRange { index: usize, len: usize },
    #[error("inter-layer prediction requested on the base layer")]
    InterLayerOnBaseLayer,
    #[error("slice requests {0} reference pictures")]
    TooManyReferences(usize),
    #[error("DPB of layer {0} is full")]
    OutOfSlots(usize),
    #[error("could not acquire a picture buffer")]
    OutOfMemory,
    #[error("output queue is full")]
    OutputQueueFull,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Broad classes of errors, telling the caller how far the failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The stream is structurally invalid. Decoding of the current picture or slice is aborted,
    /// but the session can continue with the next access unit.
    InvalidBitstream,
    /// A slot, buffer or queue entry could not be obtained. The current picture is lost.
    OutOfResources,
    /// Internal failure, e.g. a poisoned lock.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicatePoc { .. }
            | Error::InvalidReferenceIndex { .. }
            | Error::ZeroReferences
            | Error::DuplicateOrMissingReference { .. }
            | Error::SliceIndexOutOfRange { .. }
            | Error::InterLayerOnBaseLayer
            | Error::TooManyReferences(_) => ErrorKind::InvalidBitstream,
            Error::OutOfSlots(_) | Error::OutOfMemory | Error::OutputQueueFull => {
                ErrorKind::OutOfResources
            }
            Error::Other(_) => ErrorKind::Internal,
        }
    }
}

impl From<DpbError> for Error {
    fn from(err: DpbError) -> Self {
        match err {
            DpbError::OutOfSlots(layer) => Error::OutOfSlots(layer),
            DpbError::OutOfMemory => Error::OutOfMemory,
            DpbError::SliceIndexOutOfRange { index, len } => {
                Error::SliceIndexOutOfRange { index, len }
            }
        }
    }
}

/// Threading model of the decoding pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Threading {
    /// Pictures are decoded one after the other, possibly with several workers per picture.
    #[default]
    Slice,
    /// Several pictures are decoded concurrently, one worker per picture. Pictures used by
    /// another worker must be awaited until they are produced.
    Frame,
}

/// A picture leaving the decoder, in presentation order.
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub frame: Frame,
    pub poc: i32,
    pub layer: usize,
    pub pic_struct: PicStruct,
    pub props: FrameProps,
    /// Decoding timestamp of the packet being processed when the picture was output.
    pub pkt_dts: Option<i64>,
}

/// A bounded queue where decoded pictures wait until they are retrieved by the client.
///
/// The queue is a shared handle: clones push to and pop from the same queue.
#[derive(Debug, Clone)]
pub struct OutputQueue {
    queue: Arc<Mutex<VecDeque<DecodedPicture>>>,
    capacity: usize,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Default::default(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DecodedPicture>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push `picture` to the back of the queue. Fails if the queue is full, in which case the
    /// picture is dropped.
    pub fn push(&self, picture: DecodedPicture) -> Result<()> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            log::warn!("Output queue full, dropping POC {}", picture.poc);
            return Err(Error::OutputQueueFull);
        }

        queue.push_back(picture);
        Ok(())
    }

    /// Returns the next picture (if any) waiting to be dequeued.
    pub fn pop(&self) -> Option<DecodedPicture> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns all the pictures currently queued.
    pub fn drain(&self) -> Vec<DecodedPicture> {
        self.lock().drain(..).collect()
    }
}
