// SPDX-License-Identifier: GPL-3.0-or-later

//! The `fcpd` control daemon: binds a kernel audio-control device to an ALSA
//! control-surface card, synthesizes controls from a product's device map,
//! and serves firmware-update requests over a per-card UNIX socket.

pub mod cache;
pub mod daemon;
pub mod device;
pub mod dfu;
pub mod socket;
pub mod synth;
