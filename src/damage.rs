// Damage aggregator. No direct teacher analogue ships
// with wprs; grounded on `x11rb::protocol::damage` for the wire types and
// on the teacher's `Option<T>`-as-availability-flag idiom used for SHM in
// capture.rs for the "extension absent -> degraded mode" behavior.

use std::time::Duration;
use std::time::Instant;

use x11rb::connection::RequestConnection;
use x11rb::protocol::damage;
use x11rb::protocol::damage::ConnectionExt as _;
use x11rb::protocol::xproto;

use crate::connection::SharedConnection;
use crate::geometry::Rect;
use crate::prelude::*;

/// Minimum time a pending-damage window must stay open before the frame
/// loop is allowed to emit a frame for it.
pub const COALESCE_DELAY: Duration = Duration::from_millis(12);

/// Tracks a pending damage rectangle between frame commits.
///
/// When the damage extension is unavailable, the aggregator runs in
/// "always dirty, full-screen" mode: every tick reports
/// pending damage covering the whole capture surface and coalescing never
/// applies.
pub struct DamageAggregator {
    available: bool,
    damage_rect: Rect,
    pending: bool,
    first_notification: Option<Instant>,
}

impl DamageAggregator {
    /// `full_screen` seeds the initial pending rectangle.
    pub fn new(available: bool, full_screen: Rect) -> Self {
        Self {
            available,
            damage_rect: full_screen,
            pending: true,
            first_notification: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Folds a reported rectangle into the pending damage: every damage
    /// notification unions its rectangle into `damage_rect`; the first
    /// notification of a new pending window also records the monotonic
    /// time, starting the coalesce window.
    pub fn notify(&mut self, rect: Rect, now: Instant) {
        if !self.pending {
            self.pending = true;
            self.first_notification = Some(now);
            self.damage_rect = rect;
        } else {
            self.damage_rect = self.damage_rect.union(&rect);
        }
    }

    /// Forces the whole surface dirty, used when capture geometry changes
    /// or when the aggregator starts in degraded
    /// mode.
    pub fn mark_full_screen(&mut self, full_screen: Rect, now: Instant) {
        self.damage_rect = full_screen;
        self.pending = true;
        self.first_notification.get_or_insert(now);
    }

    pub fn has_pending(&self) -> bool {
        self.available && self.pending || !self.available
    }

    pub fn damage_rect(&self) -> Rect {
        self.damage_rect
    }

    /// True once `COALESCE_DELAY` has elapsed since the first notification
    /// in the current pending window. Degraded (no-extension) mode never
    /// waits: there is no notification stream to coalesce.
    pub fn coalesce_elapsed(&self, now: Instant) -> bool {
        if !self.available {
            return true;
        }
        match self.first_notification {
            Some(t) => now.saturating_duration_since(t) >= COALESCE_DELAY,
            None => false,
        }
    }

    /// Time remaining until [`Self::coalesce_elapsed`] would return `true`,
    /// for the frame loop's "sleep the remainder" step. Zero if there is no open pending window to wait on.
    pub fn remaining_coalesce(&self, now: Instant) -> Duration {
        match self.first_notification {
            Some(t) => (t + COALESCE_DELAY).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Called after a frame commits: clears the pending window in normal
    /// mode. In degraded mode damage is always pending, so the rectangle
    /// is reset to the current full-screen bounds instead of being
    /// cleared.
    pub fn acknowledge(&mut self, full_screen: Rect) {
        if self.available {
            self.pending = false;
            self.first_notification = None;
        } else {
            self.damage_rect = full_screen;
        }
    }
}

/// Wire-level counterpart to [`DamageAggregator`]: probes for the damage
/// extension, subscribes the root window if present, and acknowledges
/// notifications to the server. Kept separate from the aggregator proper
/// so the aggregation policy stays protocol-agnostic and unit-testable
/// without a connection.
pub struct DamageSubscription {
    damage: Option<damage::Damage>,
}

impl DamageSubscription {
    /// Probes `XDamageQueryExtension` and, if present, creates a damage
    /// object on `root` reporting non-empty regions. The whole probe runs
    /// under one lock acquisition.
    pub fn subscribe(conn: &SharedConnection, root: xproto::Window) -> Result<Self> {
        conn.locked(|c| {
            let available = c
                .extension_information(damage::X11_EXTENSION_NAME)
                .location(loc!())?
                .is_some();

            if !available {
                debug!("XDAMAGE unavailable; running in always-dirty full-screen mode");
                return Ok(Self { damage: None });
            }

            c.damage_query_version(1, 1).location(loc!())?.reply().location(loc!())?;

            let damage_id = c.generate_id().location(loc!())?;
            c.damage_create(damage_id, root, damage::ReportLevel::NON_EMPTY)
                .location(loc!())?
                .check()
                .location(loc!())?;

            Ok(Self {
                damage: Some(damage_id),
            })
        })
    }

    pub fn is_available(&self) -> bool {
        self.damage.is_some()
    }

    /// `XDamageSubtract`, called before capture to avoid losing a
    /// concurrent event.
    pub fn acknowledge(&self, conn: &SharedConnection) -> Result<()> {
        if let Some(damage_id) = self.damage {
            conn.locked(|c| {
                c.damage_subtract(damage_id, 0u32, 0u32).location(loc!())?;
                Ok(())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn coalesces_two_notifications_into_bounding_box() {
        let mut agg = DamageAggregator::new(true, Rect::default());
        agg.acknowledge(Rect::default());
        assert!(!agg.has_pending());

        let t0 = at(0);
        agg.notify(Rect::new(10, 10, 20, 20), t0);
        assert!(agg.has_pending());
        assert!(!agg.coalesce_elapsed(at(5)));

        agg.notify(Rect::new(100, 100, 30, 30), at(5));
        assert!(agg.coalesce_elapsed(at(12)));
        assert_eq!(agg.damage_rect(), Rect::new(10, 10, 120, 120));

        agg.acknowledge(Rect::default());
        assert!(!agg.has_pending());
    }

    #[test]
    fn degraded_mode_is_always_pending_and_never_waits() {
        let full = Rect::new(0, 0, 640, 480);
        let mut agg = DamageAggregator::new(false, full);
        assert!(agg.has_pending());
        assert!(agg.coalesce_elapsed(at(0)));
        agg.acknowledge(full);
        assert!(agg.has_pending());
        assert_eq!(agg.damage_rect(), full);
    }

    #[test]
    fn geometry_change_forces_full_screen_pending() {
        let mut agg = DamageAggregator::new(true, Rect::new(0, 0, 640, 480));
        agg.acknowledge(Rect::new(0, 0, 640, 480));
        assert!(!agg.has_pending());

        let new_full = Rect::new(0, 0, 1024, 768);
        agg.mark_full_screen(new_full, at(0));
        assert!(agg.has_pending());
        assert_eq!(agg.damage_rect(), new_full);
    }
}
