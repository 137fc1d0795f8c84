// ========================================================================================
//                         Line-oriented access to local text files
// ========================================================================================

// Summary statistics, LD matrices and variant lists all arrive either as plain text or
// gzip-compressed text. Everything that reads them goes through `open_text_source`, so the
// compression handling lives in exactly one place.

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

/// A forward-only reader of newline-terminated records.
pub trait TextSource {
    /// Returns the next line without its trailing `\n` / `\r\n`, or `None` at end of input.
    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>>;

    fn path_display(&self) -> &str;
}

fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("bgz"))
}

/// Opens `path` for line-by-line reading, transparently decompressing `.gz`/`.bgz` files.
pub fn open_text_source(path: &Path) -> io::Result<Box<dyn TextSource>> {
    let file = File::open(path).map_err(|e| annotate(path, e))?;
    if is_gzip_path(path) {
        Ok(Box::new(BufferedTextSource::new(
            path,
            BufReader::new(MultiGzDecoder::new(file)),
        )))
    } else {
        Ok(Box::new(BufferedTextSource::new(path, BufReader::new(file))))
    }
}

/// Reads the whole (possibly compressed) file into memory.
pub fn read_all_bytes(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| annotate(path, e))?;
    let mut bytes = Vec::new();
    if is_gzip_path(path) {
        MultiGzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(|e| annotate(path, e))?;
    } else {
        file.read_to_end(&mut bytes).map_err(|e| annotate(path, e))?;
    }
    Ok(bytes)
}

pub fn is_compressed(path: &Path) -> bool {
    is_gzip_path(path)
}

fn annotate(path: &Path, err: io::Error) -> io::Error {
    io::Error::new(err.kind(), format!("{}: {err}", path.display()))
}

struct BufferedTextSource<R: BufRead> {
    reader: R,
    line: Vec<u8>,
    path_display: String,
}

impl<R: BufRead> BufferedTextSource<R> {
    fn new(path: &Path, reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(1024),
            path_display: path.display().to_string(),
        }
    }
}

impl<R: BufRead> TextSource for BufferedTextSource<R> {
    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>> {
        self.line.clear();
        let bytes_read = self.reader.read_until(b'\n', &mut self.line).map_err(|e| {
            io::Error::new(e.kind(), format!("Error reading {}: {e}", self.path_display))
        })?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        Ok(Some(&self.line))
    }

    fn path_display(&self) -> &str {
        &self.path_display
    }
}
