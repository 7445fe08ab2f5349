//! Tagged-region scanner.
//!
//! Saved contexts on a kernel stack are findable only by their leading tag
//! word. The scanner walks an opaque byte window one word at a time and
//! yields the offset of every tag match; deciding whether a match is the
//! context being looked for (and not a stale or unrelated image) is the
//! caller's job.

use scroll::{LE, Pread};

/// Restartable iterator over word-aligned tag matches in a byte window.
pub struct TagScanner<'w> {
    window: &'w [u8],
    tag: u64,
    next: usize,
}

impl<'w> TagScanner<'w> {
    /// Creates a scanner over `window` looking for `tag`.
    pub fn new(window: &'w [u8], tag: u64) -> Self {
        Self {
            window,
            tag,
            next: 0,
        }
    }

    /// Rewinds the scanner to the start of the window.
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for TagScanner<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.next + 8 <= self.window.len() {
            let offset = self.next;
            self.next += 8;

            if let Ok(word) = self.window.pread_with::<u64>(offset, LE) {
                if word == self.tag {
                    return Some(offset);
                }
            }
        }

        None
    }
}
