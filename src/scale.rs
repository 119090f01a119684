// Scale maps: precomputed integer lookup tables mapping output-space
// coordinates to capture-space coordinates. Pure function of the four
// dimensions; no teacher analogue exists (wprs never
// rescales captured pixels), so this module is original to this crate,
// shaped the way the teacher shapes small owned-buffer structs (plain
// fields, no back-references, see DESIGN.md).

#[derive(Debug, Clone)]
pub struct ScaleMaps {
    pub x_map: Vec<u32>,
    pub y_map: Vec<u32>,
    pub out_w: u32,
    pub out_h: u32,
    pub cap_w: u32,
    pub cap_h: u32,
}

impl ScaleMaps {
    /// Builds maps for the given dimensions, or `None` on allocation
    /// failure — callers fall back to per-pixel arithmetic with the same
    /// formula.
    pub fn rebuild(out_w: u32, out_h: u32, cap_w: u32, cap_h: u32) -> Option<Self> {
        if out_w == 0 || out_h == 0 || cap_w == 0 || cap_h == 0 {
            return None;
        }

        let mut x_map = Vec::new();
        x_map.try_reserve_exact(out_w as usize).ok()?;
        x_map.extend((0..out_w).map(|i| map_coord(i, out_w, cap_w)));

        let mut y_map = Vec::new();
        y_map.try_reserve_exact(out_h as usize).ok()?;
        y_map.extend((0..out_h).map(|i| map_coord(i, out_h, cap_h)));

        Some(Self {
            x_map,
            y_map,
            out_w,
            out_h,
            cap_w,
            cap_h,
        })
    }

    /// True when the maps were built for dimensions other than the ones
    /// given — the frame loop rebuilds before using them whenever this is
    /// true.
    pub fn is_stale(&self, out_w: u32, out_h: u32, cap_w: u32, cap_h: u32) -> bool {
        self.out_w != out_w || self.out_h != out_h || self.cap_w != cap_w || self.cap_h != cap_h
    }
}

/// `clamp(i * cap / out, 0, cap - 1)`: the scale-map invariant every entry
/// must satisfy.
pub fn map_coord(i: u32, out: u32, cap: u32) -> u32 {
    let mapped = (i as u64 * cap as u64) / out as u64;
    mapped.min((cap - 1) as u64) as u32
}
