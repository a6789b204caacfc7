use crate::{sha256_hex, CodecError};

/// Default slice size, matching the peers' expected chunk granularity.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: usize,
    pub data: &'a [u8],
    /// Hex SHA-256 of `data` (the plaintext).
    pub hash: String,
}

/// Fixed-size slicing over a borrowed buffer. Cloning restarts nothing;
/// call [`split`] again (or clone before iterating) to walk it twice.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    inner: std::iter::Enumerate<std::slice::Chunks<'a, u8>>,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (index, data) = self.inner.next()?;
        Some(Chunk {
            index,
            data,
            hash: sha256_hex(data),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Split `data` into `chunk_size` slices; the last may be shorter and
/// empty input yields nothing.
pub fn split(data: &[u8], chunk_size: usize) -> Result<Chunks<'_>, CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::InvalidChunkSize);
    }
    Ok(Chunks {
        inner: data.chunks(chunk_size).enumerate(),
    })
}

/// Join `(index, bytes)` pairs back into one buffer. Pairs may arrive in
/// any order; indices must form `0..n` without gaps.
pub fn reassemble(mut chunks: Vec<(usize, Vec<u8>)>) -> Result<Vec<u8>, CodecError> {
    chunks.sort_by_key(|(index, _)| *index);
    for (expected, (index, _)) in chunks.iter().enumerate() {
        if *index != expected {
            return Err(CodecError::MissingChunk(expected));
        }
    }
    let total = chunks.iter().map(|(_, bytes)| bytes.len()).sum();
    let mut out = Vec::with_capacity(total);
    for (_, bytes) in chunks {
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_hundred_bytes_into_three_chunks() {
        let data: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<_> = split(&data, 256).unwrap().collect();
        let lens: Vec<_> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(lens, vec![256, 256, 188]);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(chunks[2].hash, sha256_hex(&data[512..]));
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(split(&[], 16).unwrap().count(), 0);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(matches!(split(b"abc", 0), Err(CodecError::InvalidChunkSize)));
    }

    #[test]
    fn split_is_restartable() {
        let data = vec![3u8; 100];
        let first: Vec<_> = split(&data, 30).unwrap().map(|c| c.hash).collect();
        let second: Vec<_> = split(&data, 30).unwrap().map(|c| c.hash).collect();
        assert_eq!(first, second);
        assert_eq!(split(&data, 30).unwrap().len(), 4);
    }

    #[test]
    fn reassemble_sorts_and_detects_gaps() {
        let joined = reassemble(vec![(1, b"lo".to_vec()), (0, b"hel".to_vec())]).unwrap();
        assert_eq!(joined, b"hello");

        let gap = reassemble(vec![(0, b"a".to_vec()), (2, b"c".to_vec())]);
        assert!(matches!(gap, Err(CodecError::MissingChunk(1))));
    }
}
