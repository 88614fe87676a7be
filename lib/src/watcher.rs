use std::path::Path;
use std::time::Duration;

use futures::channel::mpsc::{Receiver, Sender, channel};
use futures::SinkExt;
use notify::{Config, Event, PollWatcher, RecursiveMode, Watcher};

use crate::consts::*;
use crate::errors::*;

/// Pollers for the directories displays appear in, and the stream of their
/// events. The pollers stop when this is dropped.
pub(crate) struct Hotplug {
    _watchers: Vec<PollWatcher>,
    pub(crate) rx: Receiver<notify::Result<Event>>,
}

fn poller(tx: Sender<notify::Result<Event>>, config: Config) -> notify::Result<PollWatcher> {
    PollWatcher::new(
        move |res: notify::Result<Event>| {
            let mut tx = tx.clone();
            futures::executor::block_on(async {
                // the receiver is gone once the controller shuts down
                let _ = tx.send(res).await;
            });
        },
        config,
    )
}

pub(crate) fn hotplug_watcher(poll_interval: Duration, watch_ddc: bool) -> Result<Hotplug> {
    let (tx, rx) = channel(1);
    let config = Config::default().with_poll_interval(poll_interval);

    // sysfs attributes report a fixed size, only their contents tell changes apart
    let mut backlight = poller(tx.clone(), config.with_compare_contents(true))?;
    backlight.watch(Path::new(DEVICES_PATH), RecursiveMode::NonRecursive)?;
    let mut watchers = vec![backlight];

    if watch_ddc {
        let mut dev = poller(tx, config)?;
        dev.watch(Path::new(I2C_DEV_PATH), RecursiveMode::NonRecursive)?;
        watchers.push(dev);
    }

    Ok(Hotplug {
        _watchers: watchers,
        rx,
    })
}

/// Whether `event` is a display channel appearing or disappearing.
pub(crate) fn is_hotplug(event: &Event) -> bool {
    if !(event.kind.is_create() || event.kind.is_remove()) {
        return false;
    }
    event.paths.iter().any(|path| {
        let Some(parent) = path.parent() else {
            return false;
        };
        if parent == Path::new(DEVICES_PATH) {
            return true;
        }
        parent == Path::new(I2C_DEV_PATH)
            && path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(I2C_DEV_PREFIX))
    })
}

#[cfg(test)]
mod tests {
    use notify::EventKind;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    use super::*;

    #[test]
    fn only_display_channels_count() {
        let new_panel = Event::new(EventKind::Create(CreateKind::Any))
            .add_path(Path::new(DEVICES_PATH).join("intel_backlight"));
        assert!(is_hotplug(&new_panel));

        let unplugged = Event::new(EventKind::Remove(RemoveKind::Any)).add_path("/dev/i2c-4".into());
        assert!(is_hotplug(&unplugged));

        let tty = Event::new(EventKind::Create(CreateKind::Any)).add_path("/dev/ttyUSB0".into());
        assert!(!is_hotplug(&tty));

        let brightness = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(Path::new(DEVICES_PATH).join("intel_backlight"));
        assert!(!is_hotplug(&brightness));
    }
}
