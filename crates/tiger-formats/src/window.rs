//! Bounded view over a byte range of a seekable stream

use std::io::{self, Read, Seek, SeekFrom};

/// Read-only window `[start, start + len)` over `inner`.
///
/// Reads never go past the end of the window and seeks are relative to its
/// start.
#[derive(Debug)]
pub struct WindowReader<R> {
    inner: R,
    start: u64,
    len: u64,
    position: u64,
}

impl<R: Read + Seek> WindowReader<R> {
    /// Create a window; the inner stream is positioned on first read
    pub const fn new(inner: R, start: u64, len: u64) -> Self {
        Self {
            inner,
            start,
            len,
            position: 0,
        }
    }

    /// Window length
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// True for an empty window
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the remaining window into a buffer
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let remaining = self.len.saturating_sub(self.position) as usize;
        let mut buffer = Vec::with_capacity(remaining);
        self.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Release the inner stream
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for WindowReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.position);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let wanted = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.inner.seek(SeekFrom::Start(self.start + self.position))?;
        let read = self.inner.read(&mut buf[..wanted])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<R: Read + Seek> Seek for WindowReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.len) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the window",
            ));
        }
        self.position = u64::try_from(target).unwrap_or(u64::MAX);
        Ok(self.position)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_stay_inside_window() {
        let data: Vec<u8> = (0..100).collect();
        let mut window = WindowReader::new(Cursor::new(data), 10, 5);

        let mut buffer = [0u8; 16];
        let read = window.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..read], &[10, 11, 12, 13, 14]);
        assert_eq!(window.read(&mut buffer).unwrap(), 0);
    }

    #[test]
    fn seeks_are_window_relative() {
        let data: Vec<u8> = (0..100).collect();
        let mut window = WindowReader::new(Cursor::new(data), 20, 10);

        assert_eq!(window.seek(SeekFrom::End(-2)).unwrap(), 8);
        assert_eq!(window.read_all().unwrap(), vec![28, 29]);

        window.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(window.read_all().unwrap().len(), 10);
        assert!(window.seek(SeekFrom::Current(-11)).is_err());

        // Seeking past the end is allowed but yields no data
        window.seek(SeekFrom::Start(50)).unwrap();
        assert!(window.read_all().unwrap().is_empty());
    }
}
