// Input injector. Grounded on the per-user
// `pressed_buttons: HashSet<u32>` delta-tracking idiom in
// examples/wayland-transpositor-wprs/src/server/client_handlers.rs,
// generalized from wprs's single local seat to a per-remote-user
// `last_mask` model and synthesised over XTest instead of a local
// Wayland seat.
//
// Shares the session's one `SharedConnection` with the capture path:
// each gesture — a motion plus its button deltas, or a single key event —
// runs inside one `locked()` call, so it reaches the server as one
// ordered burst relative to whatever the frame loop is doing at the time.

use std::collections::HashMap;
use std::sync::Arc;

use x11rb::connection::Connection;
use x11rb::protocol::xproto;
use x11rb::protocol::xproto::ConnectionExt as _;
use x11rb::protocol::xtest::ConnectionExt as _;

use crate::connection::SharedConnection;
use crate::prelude::*;

/// The five logical mouse buttons, as bitmask values within the
/// caller-supplied button mask.
const BUTTON_BITS: [u8; 5] = [1, 2, 4, 8, 16];

struct KeyboardMapping {
    min_keycode: u8,
    keysyms_per_keycode: u8,
    keysyms: Vec<u32>,
}

impl KeyboardMapping {
    fn load(conn: &SharedConnection) -> Result<Self> {
        conn.locked(|c| {
            let setup = c.setup();
            let min_keycode = setup.min_keycode;
            let count = setup.max_keycode - setup.min_keycode + 1;
            let reply = c
                .get_keyboard_mapping(min_keycode, count)
                .location(loc!())?
                .reply()
                .location(loc!())?;
            Ok(Self {
                min_keycode,
                keysyms_per_keycode: reply.keysyms_per_keycode,
                keysyms: reply.keysyms,
            })
        })
    }

    /// First keycode whose keysym list contains `keysym`, or `None` if no
    /// mapping exists — the input injector silently drops such events.
    fn keycode_for(&self, keysym: u32) -> Option<u8> {
        let per = self.keysyms_per_keycode as usize;
        if per == 0 {
            return None;
        }
        self.keysyms
            .chunks(per)
            .position(|syms| syms.contains(&keysym))
            .map(|idx| self.min_keycode + idx as u8)
    }
}

/// Synthesises mouse and keyboard input on the root window via XTest.
pub struct InputInjector {
    conn: Arc<SharedConnection>,
    root: xproto::Window,
    keyboard: KeyboardMapping,
    last_masks: HashMap<u32, u8>,
}

impl InputInjector {
    pub fn new(conn: Arc<SharedConnection>, root: xproto::Window) -> Result<Self> {
        let keyboard = KeyboardMapping::load(&conn).location(loc!())?;
        Ok(Self {
            conn,
            root,
            keyboard,
            last_masks: HashMap::new(),
        })
    }

    /// Synthesises absolute motion to `(x, y)` in root coordinates, then
    /// for each of the 5 logical buttons, a press/release if its bit
    /// changed relative to the user's last mask. The whole gesture runs
    /// under one lock acquisition.
    pub fn mouse_event(&mut self, user: u32, x: i16, y: i16, mask: u8) -> Result<()> {
        let last_mask = self.last_masks.get(&user).copied().unwrap_or(0);
        let mut deltas = Vec::new();
        for (button, &bit) in BUTTON_BITS.iter().enumerate() {
            let was_down = last_mask & bit != 0;
            let is_down = mask & bit != 0;
            if was_down == is_down {
                continue;
            }
            let event_type = if is_down {
                xproto::BUTTON_PRESS_EVENT
            } else {
                xproto::BUTTON_RELEASE_EVENT
            };
            deltas.push((event_type, button as u8 + 1));
        }

        let root = self.root;
        self.conn.locked(|c| {
            c.xtest_fake_input(xproto::MOTION_NOTIFY_EVENT, 0, 0, root, x, y, 0)
                .location(loc!())?;
            for &(event_type, button) in &deltas {
                c.xtest_fake_input(event_type, button, 0, root, 0, 0, 0).location(loc!())?;
            }
            c.flush().location(loc!())?;
            Ok(())
        })?;

        self.last_masks.insert(user, mask);
        Ok(())
    }

    /// Translates `keysym` to a keycode and synthesises a press or
    /// release; silently ignores keysyms with no mapping.
    pub fn key_event(&mut self, keysym: u32, pressed: bool) -> Result<()> {
        let Some(keycode) = self.keyboard.keycode_for(keysym) else {
            return Ok(());
        };
        let event_type = if pressed {
            xproto::KEY_PRESS_EVENT
        } else {
            xproto::KEY_RELEASE_EVENT
        };
        let root = self.root;
        self.conn.locked(|c| {
            c.xtest_fake_input(event_type, keycode, 0, root, 0, 0, 0).location(loc!())?;
            c.flush().location(loc!())?;
            Ok(())
        })
    }

    /// Drops per-user tracking state, e.g. when a remote user disconnects.
    pub fn forget_user(&mut self, user: u32) {
        self.last_masks.remove(&user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(min_keycode: u8, keysyms_per_keycode: u8, keysyms: Vec<u32>) -> KeyboardMapping {
        KeyboardMapping {
            min_keycode,
            keysyms_per_keycode,
            keysyms,
        }
    }

    #[test]
    fn keycode_for_finds_first_matching_row() {
        // keycodes 8,9,10 with 2 keysyms each.
        let m = mapping(8, 2, vec![0x61, 0x41, 0x62, 0x42, 0x63, 0x43]);
        assert_eq!(m.keycode_for(0x62), Some(9));
        assert_eq!(m.keycode_for(0x43), Some(10));
    }

    #[test]
    fn keycode_for_unmapped_keysym_is_none() {
        let m = mapping(8, 2, vec![0x61, 0x41]);
        assert_eq!(m.keycode_for(0xDEAD), None);
    }

    #[test]
    fn button_bits_cover_five_logical_buttons() {
        assert_eq!(BUTTON_BITS, [1, 2, 4, 8, 16]);
    }
}
