// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod boot;
pub mod config;
pub mod fstab;
pub mod hexpatch;
pub mod ramdisk;
