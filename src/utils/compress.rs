//! Transparent decompression for pair list files.
//!
//! The pair source accepts plain text, gzip (`.gz`) and xz (`.xz`) encoded
//! files, detected purely from the file name suffix.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use flate2::read::MultiGzDecoder;
use log::error;
use xz2::read::XzDecoder;
use crate::error::Failed;

/// Opens `path`, wrapping it in a decompressing reader if its suffix
/// indicates one, and returns a buffered line reader.
pub fn open_lines(path: &Path) -> Result<Box<dyn BufRead>, Failed> {
    let file = File::open(path).map_err(|err| {
        error!("Failed to open {}: {}", path.display(), err);
        Failed
    })?;
    Ok(open_lines_from(path, file))
}

/// Like [`open_lines`] but reads from an already-open source, used for
/// standard input (which never carries a compression suffix).
pub fn open_lines_from(
    path: &Path, file: impl io::Read + 'static
) -> Box<dyn BufRead> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gz") => Box::new(BufReader::new(MultiGzDecoder::new(file))),
        Some("xz") => Box::new(BufReader::new(XzDecoder::new(file))),
        _ => Box::new(BufReader::new(file)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn plain_passthrough() {
        let data = Cursor::new(b"AAAA BBBB\n".to_vec());
        let mut reader = open_lines_from(Path::new("pairs.txt"), data);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "AAAA BBBB\n");
    }
}
