use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Slot {
    text: String,
    finished: bool,
}

/// Text produced by a streamer callback, waiting to be picked up by the request.
///
/// The callback may run on the executor thread while the request thread drains, so the
/// buffer and the finished flag live behind one mutex.
#[derive(Debug, Default)]
pub struct StreamMailbox {
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl StreamMailbox {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, text: &str) {
        let mut slot = self.lock();
        slot.text.push_str(text);
        self.signal.notify_one();
    }

    /// Drains the buffer, leaving it empty.
    pub fn take(&self) -> String {
        std::mem::take(&mut self.lock().text)
    }

    pub fn finish(&self) {
        let mut slot = self.lock();
        slot.finished = true;
        self.signal.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Blocks until there is text or the producer has finished. Returns the drained
    /// text together with the finished flag observed under the same lock.
    pub fn wait_for_text_or_finish(&self) -> (String, bool) {
        let slot = self.lock();
        let mut slot = self
            .signal
            .wait_while(slot, |slot| slot.text.is_empty() && !slot.finished)
            .unwrap_or_else(PoisonError::into_inner);
        (std::mem::take(&mut slot.text), slot.finished)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn test_take_resets_buffer() {
        let mailbox = StreamMailbox::default();
        mailbox.append("Hel");
        mailbox.append("lo");
        assert_eq!(mailbox.take(), "Hello");
        assert_eq!(mailbox.take(), "");
    }

    #[test]
    fn test_wait_wakes_on_append() {
        let mailbox = Arc::new(StreamMailbox::default());
        let producer = mailbox.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.append("x");
        });
        assert_eq!(mailbox.wait_for_text_or_finish(), ("x".to_owned(), false));
        handle.join().expect("test");
    }

    #[test]
    fn test_wait_returns_leftover_with_finish() {
        let mailbox = StreamMailbox::default();
        mailbox.append("tail");
        mailbox.finish();
        assert_eq!(mailbox.wait_for_text_or_finish(), ("tail".to_owned(), true));
        assert_eq!(mailbox.wait_for_text_or_finish(), (String::new(), true));
    }
}
