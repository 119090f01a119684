// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Entry point. Wires `Settings` into a `Session`, runs the frame loop on
// its own thread, and blocks the main thread waiting for a shutdown
// signal (Ctrl-C). Grounded on `bin/wprsd.rs`'s `main()` shape
// (`configure_tracing` + `exit_on_thread_panic` first, then build and run
// the server), but with a `thread::scope`-owned frame-loop thread instead
// of a `calloop` event loop, since this engine has no reactor of its own.
//
// Wiring a real downstream transport for the display sink is left to
// whatever process embeds this engine; `NullSink` below exists only so
// this binary is runnable on its own to prove the capture/scale/commit
// path end-to-end.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread;

use clap::Parser;
use nix::sys::signal;
use nix::sys::signal::SigHandler;
use nix::sys::signal::Signal;
use tracing::Level;
use xorg_capture_engine::config::Args;
use xorg_capture_engine::display::DisplaySink;
use xorg_capture_engine::display::Layer;
use xorg_capture_engine::display::LayerKind;
use xorg_capture_engine::frame_loop;
use xorg_capture_engine::geometry::Rect;
use xorg_capture_engine::logging;
use xorg_capture_engine::prelude::*;
use xorg_capture_engine::session::Session;
use xorg_capture_engine::session::SessionId;

/// Discards every frame. Satisfies [`DisplaySink`] so the engine can run
/// without a real transport wired in; a production embedder replaces this
/// with one that actually ships bytes to remote viewers.
#[derive(Default)]
struct NullLayer {
    width: u32,
    height: u32,
    buf: Vec<u8>,
    stride: usize,
}

impl Layer for NullLayer {
    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.width = width;
        self.height = height;
        self.stride = width as usize * 4;
        self.buf = vec![0u8; self.stride * height as usize];
        Ok(())
    }

    fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    fn open_raw(&mut self) -> Result<(&mut [u8], usize)> {
        Ok((&mut self.buf, self.stride))
    }

    fn close_raw(&mut self, _rect: Rect) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct NullSink {
    default_layer: NullLayer,
    cursor_layer: NullLayer,
}

impl DisplaySink for NullSink {
    fn layer(&mut self, kind: LayerKind) -> &mut dyn Layer {
        match kind {
            LayerKind::Default => &mut self.default_layer,
            LayerKind::Cursor => &mut self.cursor_layer,
        }
    }

    fn set_cursor_hotspot(&mut self, _x: u32, _y: u32) -> Result<()> {
        Ok(())
    }

    fn end_mouse_frame(&mut self) -> Result<()> {
        Ok(())
    }

    fn end_frame(&mut self) -> Result<()> {
        Ok(())
    }

    fn dup(&self) -> Result<Box<dyn DisplaySink>> {
        Ok(Box::new(Self::default()))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

static STOP_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_stop_signal(_: i32) {
    if let Some(stop) = STOP_FLAG.get() {
        stop.store(true, Ordering::SeqCst);
    }
}

/// Requests a clean shutdown on SIGINT/SIGTERM instead of the default
/// terminate-the-process behavior, so `Session`'s `Drop` impl still runs.
fn install_signal_handler(stop: Arc<AtomicBool>) -> Result<()> {
    STOP_FLAG.set(stop).map_err(|_| anyhow!("signal handler already installed"))?;
    let handler = SigHandler::Handler(handle_stop_signal);
    // SAFETY: the handler only stores to an `AtomicBool` through a
    // `OnceLock` that is fully initialised before this call, which is the
    // narrow set of operations safe to perform from a signal handler.
    unsafe {
        signal::signal(Signal::SIGINT, handler).location(loc!())?;
        signal::signal(Signal::SIGTERM, handler).location(loc!())?;
    }
    Ok(())
}

pub fn main() -> Result<()> {
    let settings = Args::parse().load();

    logging::configure_tracing(Level::INFO, None::<&str>, Level::TRACE).location(loc!())?;
    logging::exit_on_thread_panic();

    let mut session = Session::open(
        SessionId(0),
        settings.display.as_deref(),
        settings.disable_xshm,
        Box::new(NullSink::default()),
    )
    .location(loc!())?;

    install_signal_handler(session.stop_flag())?;

    info!(fps = settings.fps, "starting capture engine");

    thread::scope(|scope| {
        let handle = thread::Builder::new()
            .name("frame-loop".to_string())
            .spawn_scoped(scope, || frame_loop::run(&mut session, settings.fps))
            .location(loc!())?;

        logging::join_unwrap(handle).location(loc!())
    })
}
