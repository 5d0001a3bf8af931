// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Serde helpers for ramdisk permission bits written as octal strings in patch
//! profiles. TOML has octal integer literals, but toml_edit never emits them, so
//! modes are stored as strings like `"0750"` instead.

use std::fmt;

use serde::{Deserializer, Serializer, de::Visitor};

/// Highest value allowed for the permission and sticky/setuid/setgid bits.
pub const MAX_MODE: u16 = 0o7777;

/// Parse a mode string. A leading `0o` prefix is accepted.
pub fn parse_mode(data: &str) -> Result<u16, String> {
    let digits = data.strip_prefix("0o").unwrap_or(data);
    if digits.is_empty() {
        return Err("empty file mode".to_owned());
    }

    let mode = u16::from_str_radix(digits, 8)
        .map_err(|e| format!("invalid octal file mode: {data:?}: {e}"))?;
    if mode > MAX_MODE {
        return Err(format!("file mode out of range: {data:?}"));
    }

    Ok(mode)
}

pub fn serialize<S>(mode: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{mode:04o}"))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct ModeVisitor;

    impl Visitor<'_> for ModeVisitor {
        type Value = u16;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a string containing an octal file mode")
        }

        fn visit_str<E>(self, data: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_mode(data).map_err(E::custom)
        }
    }

    deserializer.deserialize_str(ModeVisitor)
}
