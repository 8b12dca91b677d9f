// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 data structures shared by the decoding context: stream parameters as delivered by the
//! parser, picture structure codes, and the Decoded Picture Buffer.

pub mod concealment;
pub mod dpb;
pub mod params;
pub mod picture;
