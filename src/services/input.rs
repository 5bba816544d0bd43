// Author: BlackIce Project
// License: MIT

use std::fs::{File, OpenOptions};
use std::os::unix::{fs::OpenOptionsExt, io::OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use input::event::keyboard::{KeyState, KeyboardEventTrait};
use input::event::KeyboardEvent;
use input::{Event, Libinput, LibinputInterface};
use libc::{O_RDONLY, O_RDWR, O_WRONLY};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::core::events::StopSource;
use crate::monitor::InputActivity;

const DISPATCH_PAUSE: Duration = Duration::from_millis(50);

struct Interface;

impl LibinputInterface for Interface {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        OpenOptions::new()
            .custom_flags(flags)
            .read((flags & O_RDONLY != 0) | (flags & O_RDWR != 0))
            .write((flags & O_WRONLY != 0) | (flags & O_RDWR != 0))
            .open(path)
            .map(Into::into)
            .map_err(|err| err.raw_os_error().unwrap_or(-1))
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(File::from(fd));
    }
}

/// Host-seat input listener.
///
/// Feeds bare timestamps into the activity monitor (no key contents are
/// read beyond the one code compared against the emergency hotkey) and
/// fires the emergency trigger on that hotkey.
///
/// Runs on a dedicated OS thread; it observes `shutdown` between
/// dispatches so the process can exit.
pub fn spawn_input_listener(
    activity: Arc<InputActivity>,
    hotkey_code: Option<u32>,
    hotkey_tx: mpsc::UnboundedSender<StopSource>,
    shutdown: watch::Receiver<bool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut li = Libinput::new_with_udev(Interface);
        if li.udev_assign_seat("seat0").is_err() {
            warn!("libinput: could not assign seat0; input monitoring disabled");
            return;
        }
        info!(hotkey_code, "input listener started");

        loop {
            if *shutdown.borrow() {
                info!("input listener stopping");
                return;
            }

            if li.dispatch().is_err() {
                warn!("libinput dispatch failed; input monitoring disabled");
                return;
            }

            let now = now_ms();
            for event in &mut li {
                match event {
                    Event::Pointer(_) => activity.touch_mouse(now),
                    Event::Keyboard(KeyboardEvent::Key(key)) => {
                        activity.touch_key(now);
                        if key.key_state() == KeyState::Pressed
                            && hotkey_code == Some(key.key())
                        {
                            // The daemon loop owns the actual trigger.
                            let _ = hotkey_tx.send(StopSource::Hotkey);
                        }
                    }
                    Event::Keyboard(_) => activity.touch_key(now),
                    _ => {}
                }
            }

            std::thread::sleep(DISPATCH_PAUSE);
        }
    })
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
