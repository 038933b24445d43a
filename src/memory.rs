use crate::control::{ProcessControl, TraceHandle, WORD_SIZE};
use crate::error::Result;

/// Byte-granular access to tracee memory, built on word peeks and pokes.
///
/// Blanket-implemented for every [`ProcessControl`]. Only aligned words are transferred, so
/// a range never touches a word outside of it, and a range ending at the end of a mapping
/// stays inside it. Partial words are always read-modify-written, so bytes outside the
/// requested range are preserved.
pub trait MemoryPatcher: ProcessControl {
    fn read_bytes(&self, handle: TraceHandle, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len);

        for (at, offset, take) in words(addr, len) {
            let word = self.peek_word(handle, at)?.to_le_bytes();
            data.extend_from_slice(&word[offset..offset + take]);
        }

        Ok(data)
    }

    fn write_bytes(&mut self, handle: TraceHandle, addr: u64, bytes: &[u8]) -> Result<()> {
        let mut rest = bytes;

        for (at, offset, take) in words(addr, bytes.len()) {
            let (chunk, tail) = rest.split_at(take);
            rest = tail;

            let word = if take == WORD_SIZE {
                splice(0, 0, chunk)
            } else {
                let current = self.peek_word(handle, at)?;
                splice(current, offset, chunk)
            };

            self.poke_word(handle, at, word)?;
        }

        Ok(())
    }
}

impl<C: ProcessControl + ?Sized> MemoryPatcher for C {}

// Split `len` bytes at `addr` into aligned words, yielding each word address with the offset
// and length of the part of the range inside it.
fn words(addr: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize)> {
    let mask = WORD_SIZE as u64 - 1;
    let end = addr.wrapping_add(len as u64);
    let mut at = addr;

    std::iter::from_fn(move || {
        if at == end {
            return None;
        }

        let base = at & !mask;
        let offset = (at & mask) as usize;
        let take = (WORD_SIZE - offset).min(end.wrapping_sub(at) as usize);

        at = at.wrapping_add(take as u64);

        Some((base, offset, take))
    })
}

/// Overwrite the bytes of `word` starting at byte `offset` with `bytes`, leaving the rest
/// intact. Bytes past the end of the word are ignored.
pub(crate) fn splice(word: u64, offset: usize, bytes: &[u8]) -> u64 {
    let mut data = word.to_le_bytes();
    let offset = offset.min(WORD_SIZE);
    let len = bytes.len().min(WORD_SIZE - offset);

    data[offset..offset + len].copy_from_slice(&bytes[..len]);

    u64::from_le_bytes(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splice_low_byte() {
        let word = 0x1122_3344_5566_7788;

        assert_eq!(splice(word, 0, &[0xcc]), 0x1122_3344_5566_77cc);
        assert_eq!(splice(word, 0, &[0xaa, 0xbb]), 0x1122_3344_5566_bbaa);
    }

    #[test]
    fn test_splice_at_offset() {
        let word = 0x1122_3344_5566_7788;

        assert_eq!(splice(word, 3, &[0xcc]), 0x1122_33cc_5566_7788);
        assert_eq!(splice(word, 7, &[0xcc]), 0xcc22_3344_5566_7788);
        assert_eq!(splice(word, 6, &[0xaa, 0xbb, 0xdd]), 0xbbaa_3344_5566_7788);
    }

    #[test]
    fn test_splice_whole_word() {
        let bytes = [1, 2, 3, 4, 5, 6, 7, 8];

        assert_eq!(splice(u64::MAX, 0, &bytes), 0x0807_0605_0403_0201);
    }

    #[test]
    fn test_splice_empty() {
        assert_eq!(splice(42, 0, &[]), 42);
        assert_eq!(splice(42, 8, &[1]), 42);
    }

    #[test]
    fn test_words_within_one() {
        let words: Vec<_> = words(0x1002, 2).collect();

        assert_eq!(words, vec![(0x1000, 2, 2)]);
    }

    #[test]
    fn test_words_spanning_two() {
        let words: Vec<_> = words(0x1007, 2).collect();

        assert_eq!(words, vec![(0x1000, 7, 1), (0x1008, 0, 1)]);
    }

    #[test]
    fn test_words_aligned() {
        let words: Vec<_> = words(0x1000, 16).collect();

        assert_eq!(words, vec![(0x1000, 0, 8), (0x1008, 0, 8)]);
        assert_eq!(super::words(0x1000, 0).count(), 0);
    }
}
