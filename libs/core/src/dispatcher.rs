// SPDX-License-Identifier: GPL-3.0-or-later

use {
    super::*,
    alsactl::{prelude::CardExt, Card},
    glib::{prelude::IsA, source, ControlFlow, MainContext, MainLoop, Source},
    nix::sys::signal,
    std::{sync::Arc, thread, time::Duration},
};

/// Runs one glib main loop on a dedicated OS thread and owns everything attached to it.
///
/// The daemon's core state (control registry, caches, transport handle) is never mutated
/// from a dispatcher thread; every attached source only forwards an event through a channel
/// back to the single consumer loop in `RuntimeOperation::run`.
pub struct Dispatcher {
    name: String,
    th: Option<thread::JoinHandle<()>>,
    ev_loop: Arc<MainLoop>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.ev_loop.quit();

        if let Some(th) = self.th.take() {
            if th.join().is_err() {
                eprintln!("Fail to join thread for {}.", self.name);
            }
        }
    }
}

impl Dispatcher {
    pub fn run(name: String) -> Result<Dispatcher, Error> {
        // Own context, independent of any other dispatcher's loop.
        let ctx = MainContext::new();
        let ev_loop = Arc::new(MainLoop::new(Some(&ctx), false));

        let l = ev_loop.clone();
        let th = thread::spawn(move || {
            l.run();
        });

        // TODO: better mechanism to wait for the launch.
        loop {
            thread::sleep(Duration::from_millis(10));

            if ev_loop.is_running() {
                break;
            }
        }

        let th = Some(th);
        Ok(Dispatcher { name, th, ev_loop })
    }

    pub fn stop(&mut self) {
        self.ev_loop.quit();
    }

    fn attach_src_to_ctx(&mut self, src: &Source) {
        let ctx = self.ev_loop.context();
        src.attach(Some(&ctx));
    }

    pub fn attach_signal_handler<F>(&mut self, signum: signal::Signal, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src =
            source::unix_signal_source_new(signum as i32, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }

    /// Attach the audio-control surface so that element add/remove/value events arrive as
    /// glib events on this dispatcher's loop rather than being polled for.
    pub fn attach_snd_card<C, F>(&mut self, card: &C, disconnect_cb: F) -> Result<(), Error>
    where
        C: IsA<Card>,
        F: Fn(&C) + 'static,
    {
        let src = card.create_source()?;

        card.connect_handle_disconnection(disconnect_cb);

        self.attach_src_to_ctx(&src);

        Ok(())
    }

    pub fn attach_interval_handler<F>(&mut self, interval: Duration, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src = source::timeout_source_new(interval, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }
}
