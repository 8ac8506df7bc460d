use mio::event::Event;

/// Readiness snapshot handed to channel drivers.
///
/// Wraps the parts of [`mio::event::Event`] the drivers care about so they
/// never touch the platform event type directly.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
        }
    }
}
