// Capture backend: acquires a rectangle of the root window as an
// image, preferring the MIT-SHM fast path over a synchronous `GetImage`
// fallback. Grounded directly on `X11FullscreenBackend` in
// examples/wayland-transpositor-wprs/src/server/backends/x11/x11.rs —
// same `x11rb::rust_connection::RustConnection`, same FD-passing SHM
// sequence (`shm_create_segment` + `shm_attach_fd`), same
// `PixmapFormatInfo`/`compute_stride_bytes` stride arithmetic (kept
// verbatim, including its unit tests).

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use nix::sys::mman;
use x11rb::connection::Connection;
use x11rb::connection::RequestConnection;
use x11rb::protocol::Event;
use x11rb::protocol::shm;
use x11rb::protocol::shm::ConnectionExt as _;
use x11rb::protocol::xproto;
use x11rb::protocol::xproto::ConnectionExt as _;

use crate::connection::SharedConnection;
use crate::cursor;
use crate::cursor::CursorImage;
use crate::cursor::CursorTracker;
use crate::damage::DamageAggregator;
use crate::damage::DamageSubscription;
use crate::geometry::Rect;
use crate::pixel_format::visual_channel_masks;
use crate::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct PixmapFormatInfo {
    pub bits_per_pixel: u8,
    pub bytes_per_pixel: usize,
}

impl PixmapFormatInfo {
    pub fn for_depth(setup: &xproto::Setup, depth: u8) -> Result<Self> {
        let format = setup
            .pixmap_formats
            .iter()
            .find(|fmt| fmt.depth == depth)
            .ok_or_else(|| anyhow!("missing pixmap format for depth {depth}"))?;

        let bits_per_pixel = format.bits_per_pixel;
        ensure!(
            bits_per_pixel % 8 == 0,
            "unsupported bits-per-pixel: {bits_per_pixel}"
        );

        Ok(Self {
            bits_per_pixel,
            bytes_per_pixel: (bits_per_pixel / 8) as usize,
        })
    }
}

/// `bytes_per_line` for a row of `width` pixels at `bits_per_pixel`,
/// rounded up to the server's scanline pad.
pub fn compute_stride_bytes(width: u32, bits_per_pixel: u8, scanline_pad: u8) -> Option<usize> {
    let width_bits = (width as usize).checked_mul(bits_per_pixel as usize)?;
    let pad = scanline_pad as usize;
    if pad == 0 {
        return None;
    }
    let padded_bits = width_bits.checked_add(pad - 1)? / pad * pad;
    padded_bits.checked_div(8)
}

/// Which byte ordering the server reports for `Z_PIXMAP` images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// A rectangle of pixels as returned by [`CaptureBackend::acquire`].
///
/// This is a tagged-choice sum type rather than a buffer-plus-ownership-flag
/// pair: the `Shm` variant *borrows* the backend's reused shared-memory
/// buffer and must not outlive the borrow; the `Owned` variant carries its
/// own `Vec<u8>` from a `GetImage` reply. There is no separate "ownership"
/// flag to forget to check.
pub enum CaptureImage<'a> {
    Shm(ImageView<'a>),
    Owned(OwnedImageView),
}

pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub bytes_per_pixel: usize,
    pub byte_order: ByteOrder,
}

pub struct OwnedImageView {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub bytes_per_pixel: usize,
    pub byte_order: ByteOrder,
}

impl CaptureImage<'_> {
    pub fn width(&self) -> u32 {
        match self {
            Self::Shm(v) => v.width,
            Self::Owned(v) => v.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Shm(v) => v.height,
            Self::Owned(v) => v.height,
        }
    }

    pub fn stride(&self) -> usize {
        match self {
            Self::Shm(v) => v.stride,
            Self::Owned(v) => v.stride,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Shm(v) => v.bytes_per_pixel,
            Self::Owned(v) => v.bytes_per_pixel,
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        match self {
            Self::Shm(v) => v.byte_order,
            Self::Owned(v) => v.byte_order,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Self::Shm(v) => v.data,
            Self::Owned(v) => &v.data,
        }
    }
}

struct ShmSegment {
    shmseg: shm::Seg,
    map: NonNull<c_void>,
    map_len: usize,
    width: u32,
    height: u32,
}

// SAFETY: the mapping is only read from a single thread at a time (the
// frame-loop thread); no interior mutability is exposed.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    fn create(conn: &SharedConnection, width: u32, height: u32, bytes_per_line: usize) -> Result<Self> {
        // Over-allocate one extra scanline, as xpra/guacamole both do, so a
        // row-wise reader can never read past the mapped region on the last
        // line.
        let segment_size = bytes_per_line
            .checked_mul(height as usize + 1)
            .ok_or_else(|| anyhow!("shm segment size overflow"))?;
        ensure!(segment_size != 0, "invalid SHM segment size: 0");
        ensure!(
            segment_size <= u32::MAX as usize,
            "SHM segment too large: {segment_size}"
        );
        let map_len = NonZeroUsize::new(segment_size).ok_or_else(|| anyhow!("segment_size=0"))?;

        let (shmseg, map) = conn.locked(|c| {
            let shmseg = c.generate_id().location(loc!())?;
            let reply = c
                .shm_create_segment(shmseg, segment_size as u32, false)
                .location(loc!())?
                .reply()
                .location(loc!())?;
            let shm_fd = reply.shm_fd;

            let map = unsafe {
                mman::mmap(
                    None,
                    map_len,
                    mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                    mman::MapFlags::MAP_SHARED,
                    &shm_fd,
                    0,
                )
                .location(loc!())?
            };

            c.shm_attach_fd(shmseg, shm_fd, false)
                .location(loc!())?
                .check()
                .location(loc!())?;

            Ok((shmseg, map))
        })?;

        Ok(Self {
            shmseg,
            map,
            map_len: segment_size,
            width,
            height,
        })
    }

    fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    fn detach(&self, conn: &SharedConnection) -> Result<()> {
        conn.locked(|c| {
            c.shm_detach(self.shmseg).location(loc!())?.check().location(loc!())?;
            Ok(())
        })
    }

    /// # Safety
    /// `frame_len` must not exceed `self.map_len`.
    unsafe fn data(&self, frame_len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().cast::<u8>(), frame_len) }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if let Some(len) = NonZeroUsize::new(self.map_len) {
            let _ = unsafe { mman::munmap(self.map, len.get()) };
        }
    }
}

/// Tagged capture-backend state: SHM-ready, SHM-unavailable, or fallback.
///
/// `NotCreated` means "no segment yet, but SHM may still be attempted" —
/// entered at startup (if the extension is usable) and whenever the
/// requested size changes and the old segment must be torn down first.
/// `PermanentlyDisabled` means a real SHM error was observed (or the
/// extension was never usable, or the disable switch is set); it is never
/// left once entered — the SHM-monotonicity invariant.
enum ShmState {
    Ready(ShmSegment),
    NotCreated,
    PermanentlyDisabled,
}

pub struct CaptureBackend {
    conn: Arc<SharedConnection>,
    root: xproto::Window,
    scanline_pad: u8,
    image_byte_order: ByteOrder,
    pixmap_format: PixmapFormatInfo,
    channel_masks: (u32, u32, u32),
    shm: ShmState,
}

impl CaptureBackend {
    /// Probes the SHM extension over the shared connection. `disable_shm`
    /// mirrors `GUAC_XORG_DISABLE_XSHM`: when set, the backend never
    /// attempts SHM even if the extension is present.
    pub fn new(conn: Arc<SharedConnection>, root: xproto::Window, disable_shm: bool) -> Result<Self> {
        let (scanline_pad, image_byte_order, pixmap_format, channel_masks, shm_available) =
            conn.locked(|c| {
                let setup = c.setup();
                let screen = setup
                    .roots
                    .iter()
                    .find(|s| s.root == root)
                    .ok_or_else(|| anyhow!("root window not found in setup"))?;
                let format = setup
                    .pixmap_formats
                    .iter()
                    .find(|f| f.depth == screen.root_depth)
                    .ok_or_else(|| anyhow!("missing pixmap format for depth {}", screen.root_depth))?;
                let byte_order = match setup.image_byte_order {
                    xproto::ImageOrder::LSB_FIRST => ByteOrder::LittleEndian,
                    _ => ByteOrder::BigEndian,
                };
                let pixmap_format = PixmapFormatInfo::for_depth(setup, screen.root_depth).location(loc!())?;
                let channel_masks = visual_channel_masks(setup, screen.root_visual);

                let shm_available = !disable_shm
                    && c.extension_information(shm::X11_EXTENSION_NAME)
                        .location(loc!())?
                        .is_some()
                    && {
                        let v = c.shm_query_version().location(loc!())?.reply().location(loc!())?;
                        (v.major_version, v.minor_version) >= (1, 2)
                    };

                Ok((format.scanline_pad, byte_order, pixmap_format, channel_masks, shm_available))
            })?;

        if disable_shm {
            debug!("GUAC_XORG_DISABLE_XSHM set; forcing GetImage fallback");
        } else if !shm_available {
            debug!("MIT-SHM (>= 1.2, FD-passing) unavailable; using GetImage fallback");
        }

        Ok(Self {
            conn,
            root,
            scanline_pad,
            image_byte_order,
            pixmap_format,
            channel_masks,
            shm: if shm_available {
                ShmState::NotCreated
            } else {
                ShmState::PermanentlyDisabled
            },
        })
    }

    pub fn image_byte_order(&self) -> ByteOrder {
        self.image_byte_order
    }

    pub fn pixmap_format(&self) -> PixmapFormatInfo {
        self.pixmap_format
    }

    /// The root window's visual's `(red, green, blue)` channel masks, for
    /// [`PixelFormat::detect`](crate::pixel_format::PixelFormat::detect).
    pub fn channel_masks(&self) -> (u32, u32, u32) {
        self.channel_masks
    }

    fn stride_for(&self, width: u32) -> Result<usize> {
        compute_stride_bytes(width, self.pixmap_format.bits_per_pixel, self.scanline_pad)
            .ok_or_else(|| anyhow!("invalid stride for width={width}"))
    }

    /// Acquires `rect` of the root window. `rect` must be nonempty and lie
    /// within the current capture geometry; callers are responsible for
    /// clamping first.
    pub fn acquire(&mut self, rect: Rect) -> Result<CaptureImage<'_>> {
        ensure!(!rect.is_empty(), "acquire() called with an empty rectangle");

        if let ShmState::Ready(seg) = &self.shm {
            if !seg.matches(rect.width, rect.height) {
                let stale = std::mem::replace(&mut self.shm, ShmState::NotCreated);
                if let ShmState::Ready(seg) = stale {
                    let _ = seg.detach(&self.conn);
                }
            }
        }

        if matches!(self.shm, ShmState::NotCreated) {
            let stride = self.stride_for(rect.width).location(loc!())?;
            match ShmSegment::create(&self.conn, rect.width, rect.height, stride) {
                Ok(seg) => self.shm = ShmState::Ready(seg),
                Err(err) => {
                    warn!(?err, "SHM segment creation failed; permanently disabling SHM for this session");
                    self.shm = ShmState::PermanentlyDisabled;
                }
            }
        }

        if let ShmState::Ready(seg) = &self.shm {
            let root = self.root;
            let shmseg = seg.shmseg;
            let reply = self.conn.locked(|c| {
                c.shm_get_image(
                    root,
                    rect.left as i16,
                    rect.top as i16,
                    rect.width as u16,
                    rect.height as u16,
                    u32::MAX,
                    xproto::ImageFormat::Z_PIXMAP.into(),
                    shmseg,
                    0,
                )
                .location(loc!())?
                .reply()
                .location(loc!())
            });

            match reply {
                Ok(_) => {
                    let stride = self.stride_for(rect.width).location(loc!())?;
                    let frame_len = stride
                        .checked_mul(rect.height as usize)
                        .ok_or_else(|| anyhow!("frame_len overflow"))?;
                    ensure!(frame_len <= seg.map_len, "frame_len exceeds mapped segment");
                    // SAFETY: `frame_len` was just checked against `seg.map_len`.
                    let data = unsafe { seg.data(frame_len) };
                    return Ok(CaptureImage::Shm(ImageView {
                        data,
                        width: rect.width,
                        height: rect.height,
                        stride,
                        bytes_per_pixel: self.pixmap_format.bytes_per_pixel,
                        byte_order: self.image_byte_order,
                    }));
                }
                Err(err) => {
                    warn!(?err, "MIT-SHM capture failed; permanently disabling SHM for this session");
                    if let ShmState::Ready(seg) =
                        std::mem::replace(&mut self.shm, ShmState::PermanentlyDisabled)
                    {
                        let _ = seg.detach(&self.conn);
                    }
                    // fall through to GetImage below
                }
            }
        }

        self.get_image_fallback(rect).location(loc!())
    }

    fn get_image_fallback(&self, rect: Rect) -> Result<CaptureImage<'static>> {
        let root = self.root;
        let reply = self.conn.locked(|c| {
            c.get_image(
                xproto::ImageFormat::Z_PIXMAP,
                root,
                rect.left as i16,
                rect.top as i16,
                rect.width as u16,
                rect.height as u16,
                u32::MAX,
            )
            .location(loc!())?
            .reply()
            .location(loc!())
        })?;

        let height = rect.height as usize;
        ensure!(height != 0, "height must be non-zero");
        ensure!(
            reply.data.len() % height == 0,
            "GetImage returned non-rectangular data: len={} height={height}",
            reply.data.len()
        );
        let stride = reply.data.len() / height;
        ensure!(
            stride >= rect.width as usize * self.pixmap_format.bytes_per_pixel,
            "GetImage stride too small: stride={stride} width={}",
            rect.width
        );

        Ok(CaptureImage::Owned(OwnedImageView {
            data: reply.data,
            width: rect.width,
            height: rect.height,
            stride,
            bytes_per_pixel: self.pixmap_format.bytes_per_pixel,
            byte_order: self.image_byte_order,
        }))
    }
}

impl Drop for CaptureBackend {
    fn drop(&mut self) {
        if let ShmState::Ready(seg) =
            std::mem::replace(&mut self.shm, ShmState::PermanentlyDisabled)
        {
            let _ = seg.detach(&self.conn);
        }
    }
}

/// Everything the frame loop needs from the X side of a session: draining
/// events, re-detecting geometry, acknowledging damage, capturing pixels,
/// and fetching the cursor. Mirrors [`crate::display::DisplaySink`] on the
/// capture side, so the loop is written against a seam rather than a
/// concrete connection — `Session` owns a `Box<dyn CaptureSource>` instead
/// of a `CaptureBackend`/`DamageSubscription` pair directly, which is what
/// lets tests drive it with fakes.
pub trait CaptureSource: Send {
    /// Drains pending X events without blocking, folding damage
    /// notifications into `damage` and marking `cursor` dirty on
    /// cursor-notify events.
    fn drain_events(&mut self, damage: &mut DamageAggregator, cursor: &mut CursorTracker) -> Result<()>;

    /// Current root-window dimensions.
    fn geometry(&mut self) -> Result<(u32, u32)>;

    /// `XDamageSubtract` (or a no-op if the extension is unavailable),
    /// called before capture to avoid losing a concurrent event.
    fn acknowledge_damage(&mut self) -> Result<()>;

    fn damage_available(&self) -> bool;

    /// `(bits_per_pixel, red_mask, green_mask, blue_mask)` for
    /// [`crate::pixel_format::PixelFormat::detect`].
    fn pixel_format_inputs(&self) -> (u8, u32, u32, u32);

    fn acquire(&mut self, rect: Rect) -> Result<CaptureImage<'_>>;

    /// Fetches the current cursor image. Only called when the cursor
    /// tracker reports dirty.
    fn fetch_cursor(&mut self) -> Result<CursorImage>;

    /// Flushes buffered output after a frame commits.
    fn flush(&mut self) -> Result<()>;
}

/// The production [`CaptureSource`]: a capture backend and a damage
/// subscription sharing the session's connection.
pub struct X11Capture {
    conn: Arc<SharedConnection>,
    root: xproto::Window,
    backend: CaptureBackend,
    damage_sub: DamageSubscription,
}

impl X11Capture {
    pub fn open(conn: Arc<SharedConnection>, root: xproto::Window, disable_shm: bool) -> Result<Self> {
        let backend = CaptureBackend::new(Arc::clone(&conn), root, disable_shm).location(loc!())?;
        let damage_sub = DamageSubscription::subscribe(&conn, root).location(loc!())?;
        Ok(Self {
            conn,
            root,
            backend,
            damage_sub,
        })
    }
}

impl CaptureSource for X11Capture {
    fn drain_events(&mut self, damage: &mut DamageAggregator, cursor: &mut CursorTracker) -> Result<()> {
        loop {
            let Some(event) = self.conn.locked(|c| c.poll_for_event().location(loc!()))? else {
                return Ok(());
            };
            match event {
                Event::DamageNotify(notify) => {
                    let area = notify.area;
                    let rect = Rect::new(area.x as u32, area.y as u32, area.width as u32, area.height as u32);
                    damage.notify(rect, Instant::now());
                }
                Event::XfixesCursorNotify(_) => cursor.mark_dirty(),
                _ => {}
            }
        }
    }

    fn geometry(&mut self) -> Result<(u32, u32)> {
        let root = self.root;
        let geom = self.conn.locked(|c| c.get_geometry(root).location(loc!())?.reply().location(loc!()))?;
        Ok((geom.width as u32, geom.height as u32))
    }

    fn acknowledge_damage(&mut self) -> Result<()> {
        self.damage_sub.acknowledge(&self.conn)
    }

    fn damage_available(&self) -> bool {
        self.damage_sub.is_available()
    }

    fn pixel_format_inputs(&self) -> (u8, u32, u32, u32) {
        let (red_mask, green_mask, blue_mask) = self.backend.channel_masks();
        (self.backend.pixmap_format().bits_per_pixel, red_mask, green_mask, blue_mask)
    }

    fn acquire(&mut self, rect: Rect) -> Result<CaptureImage<'_>> {
        self.backend.acquire(rect)
    }

    fn fetch_cursor(&mut self) -> Result<CursorImage> {
        cursor::fetch_image(&self.conn)
    }

    fn flush(&mut self) -> Result<()> {
        self.conn.locked(|c| c.flush().location(loc!()))
    }
}

#[cfg(test)]
mod tests {
    use super::compute_stride_bytes;

    #[test]
    fn compute_stride_bytes_32bpp_32pad() {
        assert_eq!(compute_stride_bytes(1, 32, 32), Some(4));
        assert_eq!(compute_stride_bytes(2, 32, 32), Some(8));
        assert_eq!(compute_stride_bytes(1920, 32, 32), Some(7680));
    }

    #[test]
    fn compute_stride_bytes_24bpp_32pad_rounds_up() {
        assert_eq!(compute_stride_bytes(1, 24, 32), Some(4));
        assert_eq!(compute_stride_bytes(2, 24, 32), Some(8));
        assert_eq!(compute_stride_bytes(3, 24, 32), Some(12));
    }
}
