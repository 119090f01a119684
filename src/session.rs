// Session. Owns every sibling
// component as flat fields, never as a back-referencing graph. Grounded on the teacher's top-level
// ownership shape in `server/runtime/run_loop.rs` (a single struct holding
// the backend, the compositor state, and the stop flag as plain fields).

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use x11rb::connection::Connection as _;
use x11rb::rust_connection::RustConnection;

use crate::capture::CaptureSource;
use crate::capture::X11Capture;
use crate::connection::SharedConnection;
use crate::cursor;
use crate::cursor::CursorTracker;
use crate::damage::DamageAggregator;
use crate::display::DisplaySink;
use crate::geometry::Rect;
use crate::input::InputInjector;
use crate::pixel_format::PixelFormat;
use crate::prelude::*;
use crate::scale::ScaleMaps;

/// Distinguishes sessions in multi-session logs, threaded through
/// `tracing` spans the way the teacher threads `ClientId`/`WlSurfaceId`
/// newtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything one connected display owns.
///
/// Field order matches the required shutdown order — cursor tracker,
/// capture (which owns the capture backend and the damage subscription),
/// display, scale maps, settings — since Rust drops struct fields in
/// declaration order. The X connection itself is owned jointly by
/// `capture` and `input`, the two components that actually issue
/// requests against it: when both drop, the last `Arc<SharedConnection>`
/// clone drops with them.
pub struct Session {
    pub id: SessionId,
    cursor: CursorTracker,
    damage: DamageAggregator,
    /// Shared with whichever caller threads invoke input handlers; the
    /// frame loop never touches this field, so it can be handed out as a
    /// clone before the loop starts.
    input: Option<Arc<Mutex<InputInjector>>>,
    capture: Box<dyn CaptureSource>,
    display: Box<dyn DisplaySink>,
    scale_maps: Option<ScaleMaps>,
    pixel_format: Option<PixelFormat>,
    out_w: u32,
    out_h: u32,
    cap_w: u32,
    cap_h: u32,
    stop: Arc<AtomicBool>,
}

impl Session {
    /// Opens `display_name`, probes every optional extension, and builds
    /// the sibling components. The frame-loop thread is *not* spawned here;
    /// the caller runs it via [`crate::frame_loop::run`].
    pub fn open(
        id: SessionId,
        display_name: Option<&str>,
        disable_shm: bool,
        display: Box<dyn DisplaySink>,
    ) -> Result<Self> {
        let (raw_conn, screen_num) = RustConnection::connect(display_name).location(loc!())?;
        let root = raw_conn.setup().roots[screen_num].root;
        let conn = Arc::new(SharedConnection::new(raw_conn));

        // One connection, shared: the capture path and input injection
        // each hold an `Arc` clone, and every call either makes goes
        // through `SharedConnection::locked`, so they never race on the
        // wire.
        let mut capture: Box<dyn CaptureSource> =
            Box::new(X11Capture::open(Arc::clone(&conn), root, disable_shm).location(loc!())?);
        let (cap_w, cap_h) = capture.geometry().location(loc!())?;

        let cursor_available = cursor::probe_extension(&conn, root).location(loc!())?;
        let cursor = CursorTracker::new(cursor_available);

        let input = match InputInjector::new(Arc::clone(&conn), root) {
            Ok(injector) => Some(Arc::new(Mutex::new(injector))),
            Err(err) => {
                warn!(?err, "XTEST unavailable; input injection disabled");
                None
            }
        };

        let full_screen = Rect::new(0, 0, cap_w, cap_h);
        let mut damage = DamageAggregator::new(capture.damage_available(), full_screen);
        // Seed the coalesce window at construction time, not just the
        // `pending` flag: without this the first commit would wait on a
        // `first_notification` that a quiet display never sets.
        damage.mark_full_screen(full_screen, Instant::now());

        Ok(Self {
            id,
            out_w: cap_w,
            out_h: cap_h,
            cap_w,
            cap_h,
            pixel_format: None,
            scale_maps: None,
            capture,
            damage,
            cursor,
            input,
            display,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Builds a session directly from already-open components, bypassing
    /// any real X connection. Used to drive the frame loop against fakes.
    #[cfg(any(test, feature = "testing"))]
    pub fn for_test(
        capture: Box<dyn CaptureSource>,
        display: Box<dyn DisplaySink>,
        cursor_available: bool,
        cap_w: u32,
        cap_h: u32,
    ) -> Self {
        let full_screen = Rect::new(0, 0, cap_w, cap_h);
        let damage_available = capture.damage_available();
        let mut damage = DamageAggregator::new(damage_available, full_screen);
        damage.mark_full_screen(full_screen, Instant::now());
        Self {
            id: SessionId(0),
            cursor: CursorTracker::new(cursor_available),
            damage,
            input: None,
            capture,
            display,
            scale_maps: None,
            pixel_format: None,
            out_w: 0,
            out_h: 0,
            cap_w,
            cap_h,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn out_dimensions(&self) -> (u32, u32) {
        (self.out_w, self.out_h)
    }

    pub fn set_out_dimensions(&mut self, out_w: u32, out_h: u32) {
        self.out_w = out_w;
        self.out_h = out_h;
    }

    pub fn cap_dimensions(&self) -> (u32, u32) {
        (self.cap_w, self.cap_h)
    }

    pub fn set_cap_dimensions(&mut self, cap_w: u32, cap_h: u32) {
        self.cap_w = cap_w;
        self.cap_h = cap_h;
    }

    pub fn pixel_format(&self) -> Option<&PixelFormat> {
        self.pixel_format.as_ref()
    }

    pub fn set_pixel_format(&mut self, format: PixelFormat) {
        self.pixel_format = Some(format);
    }

    pub fn scale_maps(&self) -> Option<&ScaleMaps> {
        self.scale_maps.as_ref()
    }

    pub fn set_scale_maps(&mut self, maps: Option<ScaleMaps>) {
        self.scale_maps = maps;
    }

    pub fn capture(&mut self) -> &mut dyn CaptureSource {
        self.capture.as_mut()
    }

    /// Disjoint-field accessor: draining events needs the capture source
    /// plus mutable borrows of the damage aggregator and cursor tracker it
    /// feeds, which two separate `&mut self` methods cannot express.
    pub fn capture_damage_cursor(&mut self) -> (&mut dyn CaptureSource, &mut DamageAggregator, &mut CursorTracker) {
        (self.capture.as_mut(), &mut self.damage, &mut self.cursor)
    }

    /// Disjoint-field accessor: the frame loop needs to hold a capture
    /// source borrow (through the image it returns) and a display-layer
    /// borrow open at the same time, which two separate `&mut self`
    /// methods cannot express.
    pub fn capture_and_display(&mut self) -> (&mut dyn CaptureSource, &mut dyn DisplaySink) {
        (self.capture.as_mut(), self.display.as_mut())
    }

    pub fn damage(&mut self) -> &mut DamageAggregator {
        &mut self.damage
    }

    pub fn cursor(&mut self) -> &mut CursorTracker {
        &mut self.cursor
    }

    /// Clones the shared handle callers use to invoke input handlers from
    /// their own threads, independent of the frame loop.
    /// `None` when XTest is unavailable.
    pub fn input_handle(&self) -> Option<Arc<Mutex<InputInjector>>> {
        self.input.clone()
    }

    pub fn display(&mut self) -> &mut dyn DisplaySink {
        self.display.as_mut()
    }
}

impl Drop for Session {
    /// Releases resources in order: cursor tracker, capture (backend and
    /// damage subscription), display, scale maps, settings.
    /// `CaptureBackend`, `ShmSegment`, and the shared connection tear
    /// themselves down in their own `Drop` impls; this just documents and
    /// enforces the *field drop order*, which Rust already runs in
    /// declaration order — field order above matches the required
    /// teardown order.
    fn drop(&mut self) {
        debug!(session = %self.id, "tearing down session");
    }
}
