use std::io::Read;

use crate::error::Error;
use crate::Result;

/// One-way streaming view of a POSIX tar byte stream, backed by the `tar`
/// crate. Entries come out in archive order; a body reader never reads past
/// the entry's declared size, and abandoning a body simply skips to the next
/// header on the following [`TarStream::next_entry`] call.
pub struct TarStream<'a, R: Read + 'a> {
    entries: tar::Entries<'a, R>,
}

pub struct TarEntry<'a, R: Read + 'a> {
    name: String,
    size: u64,
    inner: tar::Entry<'a, R>,
}

impl<'a, R: Read + 'a> TarStream<'a, R> {
    pub fn new(archive: &'a mut tar::Archive<R>) -> Result<Self> {
        let entries = archive.entries().map_err(Error::Io)?;
        Ok(Self { entries })
    }

    pub fn next_entry(&mut self) -> Result<Option<TarEntry<'a, R>>> {
        match self.entries.next() {
            None => Ok(None),
            Some(Err(err)) => Err(Error::Io(err)),
            Some(Ok(entry)) => {
                let name = entry
                    .path()
                    .map_err(Error::Io)?
                    .to_string_lossy()
                    .into_owned();
                let size = entry.header().entry_size().map_err(Error::Io)?;
                Ok(Some(TarEntry {
                    name,
                    size,
                    inner: entry,
                }))
            }
        }
    }
}

impl<'a, R: Read + 'a> TarEntry<'a, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<'a, R: Read + 'a> Read for TarEntry<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn archive_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_entries_in_order() {
        let data = archive_with(&[("version", b"abc"), ("manifest", b"defg")]);
        let mut archive = tar::Archive::new(data.as_slice());
        let mut stream = TarStream::new(&mut archive).unwrap();

        let mut entry = stream.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "version");
        assert_eq!(entry.size(), 3);
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "abc");

        let entry = stream.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "manifest");
        assert_eq!(entry.size(), 4);

        // The abandoned body above must not corrupt stream position.
        assert!(stream.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_abandoned_body_is_skipped() {
        let mut large = Vec::new();
        large.write_all(&[b'x'; 4096]).unwrap();
        let data = archive_with(&[("first", &large), ("second", b"tail")]);

        let mut archive = tar::Archive::new(data.as_slice());
        let mut stream = TarStream::new(&mut archive).unwrap();

        // Do not read the first body at all.
        let entry = stream.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "first");
        drop(entry);

        let mut entry = stream.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "second");
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "tail");
    }
}
