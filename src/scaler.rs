// Scaler: blits or nearest-neighbour rescales a captured rectangle into
// the display layer's raw buffer. Grounded on the bpp-specialised pixel
// reader in
// examples/wayland-transpositor-wprs/src/server/backends/x11/x11.rs
// (`read_pixel`/`blit_ximage_to_bgra`), generalized from a fixed 1:1 blit
// to a direct-blit/general-scale split.

use crate::capture::ByteOrder;
use crate::capture::CaptureImage;
use crate::geometry::Rect;
use crate::pixel_format::PixelFormat;
use crate::pixel_format::is_fast_blit_eligible;
use crate::scale::ScaleMaps;

/// Destination buffer the scaler writes into: a raw `u32`-per-pixel, BGRX
/// row-major region with its own stride (the display layer's backing
/// store, opened for raw writes by the frame loop).
pub struct DestView<'a> {
    pub data: &'a mut [u8],
    /// Stride in bytes, which may exceed `width * 4` if the layer pads
    /// rows.
    pub stride: usize,
}

impl DestView<'_> {
    fn put_pixel(&mut self, x: u32, y: u32, bgrx: u32) {
        let offset = y as usize * self.stride + x as usize * 4;
        self.data[offset..offset + 4].copy_from_slice(&bgrx.to_le_bytes());
    }

    fn row_slice_mut(&mut self, y: u32, x_byte_offset: usize, byte_len: usize) -> &mut [u8] {
        let offset = y as usize * self.stride + x_byte_offset;
        &mut self.data[offset..offset + byte_len]
    }
}

/// Renders `src` of `image` into `dst` of `out`, either via a verbatim
/// byte copy (when the fast-path predicate holds) or nearest-neighbour
/// scaling through `maps` (recomputed inline, pixel by pixel, if `maps` is
/// `None` — the fallback for when the scale maps couldn't be allocated).
/// `cap_w`/`cap_h` are the session's full capture geometry —
/// not `image`'s dimensions, which only cover `src` (see
/// [`CaptureBackend::acquire`](crate::capture::CaptureBackend::acquire)).
#[allow(clippy::too_many_arguments)]
pub fn render(
    image: &CaptureImage<'_>,
    src: Rect,
    dst: Rect,
    format: &PixelFormat,
    maps: Option<&ScaleMaps>,
    out: &mut DestView<'_>,
    out_w: u32,
    out_h: u32,
    cap_w: u32,
    cap_h: u32,
) {
    let little_endian = image.byte_order() == ByteOrder::LittleEndian;

    if is_fast_blit_eligible(
        format,
        (image.bytes_per_pixel() * 8) as u8,
        little_endian,
        out_w,
        out_h,
        cap_w,
        cap_h,
        src == dst,
    ) {
        direct_blit(image, src, out);
        return;
    }

    general_scale(image, src, dst, format, maps, out, out_w, out_h, cap_w, cap_h);
}

/// `image` holds exactly `src`'s pixels with `(0,0)` at `(src.left,
/// src.top)` (the contract [`CaptureBackend::acquire`] returns); `out` is
/// the full output-space layer buffer, so destination writes are still
/// offset by `src.left`/`src.top`.
fn direct_blit(image: &CaptureImage<'_>, src: Rect, out: &mut DestView<'_>) {
    let row_bytes = src.width as usize * 4;
    let src_stride = image.stride();
    let data = image.data();
    let dst_x_byte_offset = src.left as usize * 4;

    for row in 0..src.height {
        let src_offset = row as usize * src_stride;
        let src_row = &data[src_offset..src_offset + row_bytes];
        out.row_slice_mut(src.top + row, dst_x_byte_offset, row_bytes).copy_from_slice(src_row);
    }
}

#[allow(clippy::too_many_arguments)]
fn general_scale(
    image: &CaptureImage<'_>,
    src: Rect,
    dst: Rect,
    format: &PixelFormat,
    maps: Option<&ScaleMaps>,
    out: &mut DestView<'_>,
    out_w: u32,
    out_h: u32,
    cap_w: u32,
    cap_h: u32,
) {
    let stride = image.stride();
    let bpp = image.bytes_per_pixel();
    let byte_order = image.byte_order();
    let data = image.data();

    let map_x = |dx: u32| match maps {
        Some(m) if !m.is_stale(out_w, out_h, cap_w, cap_h) => m.x_map[dx as usize],
        _ => crate::scale::map_coord(dx, out_w, cap_w),
    };
    let map_y = |dy: u32| match maps {
        Some(m) if !m.is_stale(out_w, out_h, cap_w, cap_h) => m.y_map[dy as usize],
        _ => crate::scale::map_coord(dy, out_h, cap_h),
    };

    for dy in dst.top..dst.bottom() {
        let src_y = map_y(dy);
        if src_y < src.top || src_y >= src.bottom() {
            continue;
        }
        let local_y = src_y - src.top;

        for dx in dst.left..dst.right() {
            let src_x = map_x(dx);
            if src_x < src.left || src_x >= src.right() {
                continue;
            }
            let local_x = src_x - src.left;

            let offset = local_y as usize * stride + local_x as usize * bpp;
            let pixel = read_src_pixel(data, offset, bpp, byte_order);
            let bgrx = format.convert_pixel(pixel);
            out.put_pixel(dx, dy, bgrx);
        }
    }
}

/// Bpp-specialised fast readers (32/24-bit, LSB/MSB), falling back to a
/// generic byte-by-byte accumulation for anything else.
fn read_src_pixel(data: &[u8], offset: usize, bytes_per_pixel: usize, byte_order: ByteOrder) -> u32 {
    match (bytes_per_pixel, byte_order) {
        (4, ByteOrder::LittleEndian) => {
            u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
        }
        (4, ByteOrder::BigEndian) => {
            u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
        }
        (3, ByteOrder::LittleEndian) => {
            u32::from(data[offset])
                | (u32::from(data[offset + 1]) << 8)
                | (u32::from(data[offset + 2]) << 16)
        }
        (3, ByteOrder::BigEndian) => {
            (u32::from(data[offset]) << 16)
                | (u32::from(data[offset + 1]) << 8)
                | u32::from(data[offset + 2])
        }
        _ => generic_read_pixel(data, offset, bytes_per_pixel, byte_order),
    }
}

/// Generic image-pixel accessor for any other bpp.
fn generic_read_pixel(data: &[u8], offset: usize, bytes_per_pixel: usize, byte_order: ByteOrder) -> u32 {
    let mut acc = 0u32;
    match byte_order {
        ByteOrder::LittleEndian => {
            for i in (0..bytes_per_pixel).rev() {
                acc = (acc << 8) | u32::from(data[offset + i]);
            }
        }
        ByteOrder::BigEndian => {
            for i in 0..bytes_per_pixel {
                acc = (acc << 8) | u32::from(data[offset + i]);
            }
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::OwnedImageView;

    fn canonical_format() -> PixelFormat {
        PixelFormat::detect(32, 0x00FF_0000, 0x0000_FF00, 0x0000_00FF).unwrap()
    }

    fn solid_image(width: u32, height: u32, bgrx: [u8; 4]) -> CaptureImage<'static> {
        let stride = width as usize * 4;
        let mut data = vec![0u8; stride * height as usize];
        for px in data.chunks_exact_mut(4) {
            px.copy_from_slice(&bgrx);
        }
        CaptureImage::Owned(OwnedImageView {
            data,
            width,
            height,
            stride,
            bytes_per_pixel: 4,
            byte_order: ByteOrder::LittleEndian,
        })
    }

    #[test]
    fn blit_identity_copies_bytes_verbatim() {
        let fmt = canonical_format();
        let image = solid_image(4, 3, [0x10, 0x20, 0x30, 0xFF]);
        let rect = Rect::new(0, 0, 4, 3);
        let mut buf = vec![0u8; 4 * 3 * 4];
        let mut out = DestView {
            data: &mut buf,
            stride: 4 * 4,
        };

        render(&image, rect, rect, &fmt, None, &mut out, 4, 3, 4, 3);

        assert_eq!(buf, image.data());
    }

    #[test]
    fn general_scale_every_dest_pixel_derives_from_one_source_pixel() {
        let fmt = canonical_format();
        // 2x2 image, distinct colors in each quadrant-ish pixel.
        let mut data = vec![0u8; 2 * 2 * 4];
        data[0..4].copy_from_slice(&[0, 0, 0xFF, 0xFF]); // (0,0) -> red
        data[4..8].copy_from_slice(&[0, 0xFF, 0, 0xFF]); // (1,0) -> green
        data[8..12].copy_from_slice(&[0xFF, 0, 0, 0xFF]); // (0,1) -> blue
        data[12..16].copy_from_slice(&[0, 0, 0, 0xFF]); // (1,1) -> black
        let image = CaptureImage::Owned(OwnedImageView {
            data,
            width: 2,
            height: 2,
            stride: 8,
            bytes_per_pixel: 4,
            byte_order: ByteOrder::LittleEndian,
        });

        let src = Rect::new(0, 0, 2, 2);
        let dst = Rect::new(0, 0, 4, 4);
        let maps = ScaleMaps::rebuild(4, 4, 2, 2).unwrap();
        let mut buf = vec![0u8; 4 * 4 * 4];
        let mut out = DestView {
            data: &mut buf,
            stride: 4 * 4,
        };

        render(&image, src, dst, &fmt, Some(&maps), &mut out, 4, 4, 2, 2);

        // top-left 2x2 block of the 4x4 output must be pure red (0x00FF0000).
        for y in 0..2u32 {
            for x in 0..2u32 {
                let off = y as usize * 16 + x as usize * 4;
                let px = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
                assert_eq!(px, 0x00FF_0000, "pixel ({x},{y}) should be pure red");
            }
        }
    }

    #[test]
    fn out_of_range_dest_rows_are_skipped_not_written() {
        let fmt = canonical_format();
        // The acquired image covers only the damaged top-half rect, per
        // `CaptureBackend::acquire`'s contract ((0,0) == (src.left, src.top)).
        let image = solid_image(4, 2, [0xAA, 0xBB, 0xCC, 0xFF]);
        let src = Rect::new(0, 0, 4, 2);
        // An identity-scale map (out == cap == 4x4) but a dst rect larger
        // than what corresponds to src, to exercise the defensive
        // out-of-bounds skip.
        let dst = Rect::new(0, 0, 4, 4);
        let maps = ScaleMaps::rebuild(4, 4, 4, 4).unwrap();
        let mut buf = vec![0xFFu8; 4 * 4 * 4];
        let mut out = DestView {
            data: &mut buf,
            stride: 4 * 4,
        };

        render(&image, src, dst, &fmt, Some(&maps), &mut out, 4, 4, 4, 4);

        // Bottom two rows map to src rows 2,3 which are outside `src`, so
        // they must be left untouched (still 0xFF sentinel).
        for y in 2..4u32 {
            for x in 0..4u32 {
                let off = y as usize * 16 + x as usize * 4;
                assert_eq!(&buf[off..off + 4], &[0xFF, 0xFF, 0xFF, 0xFF]);
            }
        }
    }
}
