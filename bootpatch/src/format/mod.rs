/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod bootimage;
pub mod compression;
pub mod cpio;
pub mod dtb;
pub mod footer;
pub mod padding;
