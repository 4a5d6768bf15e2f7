//! Mockito bodies that stall partway through until the test lets them go.
//!
//! mockito runs a chunked body on its own thread and joins that thread when the
//! connection goes away, so open (or drop) the [`Gate`] before sending another
//! request to the same server.

use std::{
    io::{self, Write},
    sync::{Mutex, PoisonError, mpsc},
};

pub(crate) struct Gate(mpsc::Sender<()>);

impl Gate {
    /// Let the body send the rest of its bytes
    pub fn open(&self) {
        let _ = self.0.send(());
    }
}

/// A body that writes `head`, waits for the gate, then writes `tail`.
/// Dropping the gate ends the body without the tail.
pub(crate) fn stalled_body(
    head: &[u8],
    tail: &[u8],
) -> (
    Gate,
    impl Fn(&mut dyn Write) -> io::Result<()> + Send + Sync + 'static,
) {
    let (sender, receiver) = mpsc::channel();
    let receiver = Mutex::new(receiver);
    let head = head.to_vec();
    let tail = tail.to_vec();

    let body = move |w: &mut dyn Write| -> io::Result<()> {
        w.write_all(&head)?;
        w.flush()?;
        let opened = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv()
            .is_ok();
        if opened {
            w.write_all(&tail)?;
        }
        Ok(())
    };
    (Gate(sender), body)
}
