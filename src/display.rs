// Display sink: the
// engine is written against this trait rather than a concrete renderer,
// matching the teacher's `PollingBackend` seam in
// `server/runtime/backend.rs` (the frame loop depends on a trait, not a
// concrete compositor backend). The `RecordingSink`/`RecordingLayer` test
// double is grounded on `server/backends/mock/mod.rs`'s `MockBackend`,
// which exists for exactly the same reason: exercising the loop's
// contract without real downstream infrastructure.

use crate::geometry::Rect;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Default,
    Cursor,
}

/// One of the display's drawable surfaces (`default_layer`/`cursor_layer`).
pub trait Layer: Send {
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    fn bounds(&self) -> Rect;

    /// Opens the backing buffer for raw writes. Returns the buffer and its
    /// stride in bytes; the caller (the scaler) must not suspend between
    /// this call and the matching [`Layer::close_raw`].
    fn open_raw(&mut self) -> Result<(&mut [u8], usize)>;

    /// Marks `rect` dirty and ends the raw-write session opened by
    /// [`Layer::open_raw`].
    fn close_raw(&mut self, rect: Rect) -> Result<()>;
}

/// The downstream display abstraction the engine renders into. Implementations own whatever transport carries frames to remote
/// viewers; the engine itself never inspects that transport.
pub trait DisplaySink: Send {
    fn layer(&mut self, kind: LayerKind) -> &mut dyn Layer;

    fn set_cursor_hotspot(&mut self, x: u32, y: u32) -> Result<()>;

    fn end_mouse_frame(&mut self) -> Result<()>;

    fn end_frame(&mut self) -> Result<()>;

    /// Duplicates the display for a newly-joined viewer.
    fn dup(&self) -> Result<Box<dyn DisplaySink>>;

    fn flush(&mut self) -> Result<()>;
}

#[cfg(any(test, feature = "testing"))]
pub use recording::RecordingLayer;
#[cfg(any(test, feature = "testing"))]
pub use recording::RecordingSink;

#[cfg(any(test, feature = "testing"))]
mod recording {
    use super::*;

    #[derive(Debug, Clone, Default)]
    pub struct RecordingLayer {
        width: u32,
        height: u32,
        buf: Vec<u8>,
        pub dirty_history: Vec<Rect>,
        open_count: u32,
    }

    impl RecordingLayer {
        fn stride(&self) -> usize {
            self.width as usize * 4
        }

        pub fn pixels(&self) -> &[u8] {
            &self.buf
        }

        pub fn open_count(&self) -> u32 {
            self.open_count
        }
    }

    impl Layer for RecordingLayer {
        fn resize(&mut self, width: u32, height: u32) -> Result<()> {
            self.width = width;
            self.height = height;
            self.buf = vec![0u8; width as usize * height as usize * 4];
            Ok(())
        }

        fn bounds(&self) -> Rect {
            Rect::new(0, 0, self.width, self.height)
        }

        fn open_raw(&mut self) -> Result<(&mut [u8], usize)> {
            self.open_count += 1;
            let stride = self.stride();
            Ok((&mut self.buf, stride))
        }

        fn close_raw(&mut self, rect: Rect) -> Result<()> {
            self.dirty_history.push(rect);
            Ok(())
        }
    }

    /// In-memory [`DisplaySink`] for exercising the frame loop and scaler
    /// without a real X server or remote-viewer transport.
    #[derive(Default)]
    pub struct RecordingSink {
        default_layer: RecordingLayer,
        cursor_layer: RecordingLayer,
        pub hotspot: (u32, u32),
        pub mouse_frames: u32,
        pub frames: u32,
        pub flushes: u32,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn default_layer(&self) -> &RecordingLayer {
            &self.default_layer
        }

        pub fn cursor_layer(&self) -> &RecordingLayer {
            &self.cursor_layer
        }
    }

    impl DisplaySink for RecordingSink {
        fn layer(&mut self, kind: LayerKind) -> &mut dyn Layer {
            match kind {
                LayerKind::Default => &mut self.default_layer,
                LayerKind::Cursor => &mut self.cursor_layer,
            }
        }

        fn set_cursor_hotspot(&mut self, x: u32, y: u32) -> Result<()> {
            self.hotspot = (x, y);
            Ok(())
        }

        fn end_mouse_frame(&mut self) -> Result<()> {
            self.mouse_frames += 1;
            Ok(())
        }

        fn end_frame(&mut self) -> Result<()> {
            self.frames += 1;
            Ok(())
        }

        fn dup(&self) -> Result<Box<dyn DisplaySink>> {
            Ok(Box::new(Self::new()))
        }

        fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn resize_then_open_raw_exposes_correctly_sized_buffer() {
            let mut sink = RecordingSink::new();
            let layer = sink.layer(LayerKind::Default);
            layer.resize(4, 2).unwrap();
            let (buf, stride) = layer.open_raw().unwrap();
            assert_eq!(stride, 16);
            assert_eq!(buf.len(), 32);
        }

        #[test]
        fn close_raw_records_dirty_rect() {
            let mut sink = RecordingSink::new();
            let layer = sink.layer(LayerKind::Cursor);
            layer.resize(8, 8).unwrap();
            layer.close_raw(Rect::new(1, 1, 3, 3)).unwrap();
            assert_eq!(sink.cursor_layer().dirty_history, vec![Rect::new(1, 1, 3, 3)]);
        }

        #[test]
        fn end_frame_and_flush_increment_counters() {
            let mut sink = RecordingSink::new();
            sink.end_frame().unwrap();
            sink.end_frame().unwrap();
            sink.flush().unwrap();
            assert_eq!(sink.frames, 2);
            assert_eq!(sink.flushes, 1);
        }
    }
}
