// Cursor tracker. No direct teacher analogue ships with
// wprs (it never tracks X11 cursor shape); grounded on the extension
// availability-probing idiom in capture.rs (`extension_information` +
// `query_version`) applied to `x11rb::protocol::xfixes`.

use x11rb::connection::RequestConnection;
use x11rb::protocol::xfixes;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto;

use crate::connection::SharedConnection;
use crate::prelude::*;

/// A cursor bitmap fetched from the fixes extension: 32-bit ARGB,
/// row-major, already in the byte layout the downstream display expects.
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub xhot: u32,
    pub yhot: u32,
    pub argb: Vec<u8>,
}

/// Tracks whether the current cursor shape needs republishing to the
/// display sink. Inert when the fixes extension is unavailable.
pub struct CursorTracker {
    available: bool,
    dirty: bool,
}

impl CursorTracker {
    /// Builds a tracker from whether the fixes extension is available.
    /// Starts dirty iff available, so the first tick always publishes an
    /// initial cursor image.
    pub fn new(available: bool) -> Self {
        Self {
            available,
            dirty: available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Called from the frame loop's event-drain step on a
    /// `XfixesCursorNotify` event.
    pub fn mark_dirty(&mut self) {
        if self.available {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Cleared only after the caller has successfully published the
    /// fetched image to the display sink.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// Probes for the fixes extension and, if present, subscribes to
/// cursor-notify events on `root`. Never fails: when the extension is
/// unavailable, the caller just builds a permanently inert
/// [`CursorTracker`] instead. The whole probe runs under one lock
/// acquisition.
pub fn probe_extension(conn: &SharedConnection, root: xproto::Window) -> Result<bool> {
    conn.locked(|c| {
        let available = c
            .extension_information(xfixes::X11_EXTENSION_NAME)
            .location(loc!())?
            .is_some();

        if available {
            c.xfixes_query_version(5, 0).location(loc!())?.reply().location(loc!())?;
            c.xfixes_select_cursor_input(root, xfixes::CursorNotifyMask::DISPLAY_CURSOR)
                .location(loc!())?
                .check()
                .location(loc!())?;
        } else {
            debug!("XFIXES unavailable; cursor tracking disabled");
        }

        Ok(available)
    })
}

/// Fetches the current cursor image synchronously. Callers only do this
/// when [`CursorTracker::is_dirty`].
pub fn fetch_image(conn: &SharedConnection) -> Result<CursorImage> {
    conn.locked(|c| {
        let reply = c.xfixes_get_cursor_image().location(loc!())?.reply().location(loc!())?;
        let argb = argb_pixels_to_bytes(&reply.cursor_image);
        Ok(CursorImage {
            width: reply.width as u32,
            height: reply.height as u32,
            xhot: reply.xhot as u32,
            yhot: reply.yhot as u32,
            argb,
        })
    })
}

/// The wire reply packs one `u32` per pixel; unpack to little-endian byte
/// rows so callers can treat the result as an opaque row-major buffer, the
/// same shape `CaptureImage::data()` exposes.
fn argb_pixels_to_bytes(pixels: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pixels.len() * 4);
    for p in pixels {
        bytes.extend_from_slice(&p.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argb_unpacking_preserves_pixel_count_and_order() {
        let pixels = [0xFF00_00FFu32, 0x8000_FF00];
        let bytes = argb_pixels_to_bytes(&pixels);
        assert_eq!(bytes.len(), 8);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), pixels[0]);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), pixels[1]);
    }
}
