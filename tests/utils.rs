// SPDX-FileCopyrightText: 2024 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

#![allow(dead_code)]

use tokio_test::io::Builder;

pub const STDERR_LAST: u64 = 0x616c7473;
pub const STDERR_WRITE: u64 = 0x64617416;
pub const STDERR_NEXT: u64 = 0x6f6c6d67;
pub const STDERR_ERROR: u64 = 0x63787470;
pub const STDERR_START_ACTIVITY: u64 = 0x53545254;
pub const STDERR_STOP_ACTIVITY: u64 = 0x53544f50;
pub const STDERR_RESULT: u64 = 0x52534c54;

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init()
        .unwrap_or_default()
}

/// A u64, as it appears on the wire.
pub fn num(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

/// A byte string, as it appears on the wire.
pub fn bytes(b: &[u8]) -> Vec<u8> {
    let mut v = num(b.len() as u64).to_vec();
    v.extend_from_slice(b);
    v.resize(8 + b.len() + (8 - b.len() % 8) % 8, 0);
    v
}

/// A string, as it appears on the wire.
pub fn string(s: &str) -> Vec<u8> {
    bytes(s.as_bytes())
}

/// The SetOptions request sent with default settings.
pub fn default_set_options(mock: &mut Builder) -> &mut Builder {
    mock.write(&num(19));
    for v in [0u64, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0, 1, 0] {
        mock.write(&num(v));
    }
    mock
}

/// A complete, successful handshake with a daemon speaking `daemon_proto`.
pub fn handshake(mock: &mut Builder, daemon_proto: u64) -> &mut Builder {
    mock.write(&num(0x6e697863))
        .read(&num(0x6478696f))
        .read(&num(daemon_proto))
        .write(&num((1 << 8) | 37))
        .write(&num(0)) // cpu affinity
        .write(&num(0)) // reserve space
        .read(&string("2.20.0"))
        .read(&num(1)) // trusted
        .read(&num(STDERR_LAST));
    default_set_options(mock).read(&num(STDERR_LAST))
}

/// A store path followed by a PathInfo, as returned by AddToStore.
pub fn valid_path_info(path: &str) -> Vec<u8> {
    let mut v = string(path);
    v.extend(string("")); // deriver
    v.extend(string(
        "sha256-1JmbR4NOsYNvgbJlqjp+4/bfm22IvhakiE1DXNfx78s=",
    ));
    v.extend(num(0)); // references[]
    v.extend(num(1700854586)); // registration_time
    v.extend(num(120)); // nar_size
    v.extend(num(1)); // ultimate
    v.extend(num(0)); // signatures[]
    v.extend(string(
        "text:sha256:0yjycizc8v9950dz9a69a7qlzcba9gl2gls8svi1g1i75xxf206d",
    ));
    v
}

/// A structured (Protocol 1.26+) error frame.
pub fn error_frame(msg: &str) -> Vec<u8> {
    let mut v = num(STDERR_ERROR).to_vec();
    v.extend(string("Error"));
    v.extend(num(0)); // level
    v.extend(string("Error"));
    v.extend(string(msg));
    v.extend(num(0)); // have_pos
    v.extend(num(0)); // traces[]
    v
}
