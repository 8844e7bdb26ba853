/// One WritePacket worth of program data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Low 16 bits of the flash address.
    pub address: u16,
    pub data: Vec<u8>,
}

/// Walks a program region in fixed-size steps, ascending.
///
/// The last chunk is padded with 0xFF to the full chunk size. Resetting the
/// cursor replays exactly the same chunks.
#[derive(Debug, Clone)]
pub struct PacketChunker<'a> {
    start: u32,
    program: &'a [u8],
    chunk_size: usize,
    cursor: usize,
}

impl<'a> PacketChunker<'a> {
    pub fn new(start: u32, program: &'a [u8], chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            start,
            program,
            chunk_size,
            cursor: 0,
        }
    }

    /// Total number of chunks in the region.
    pub fn len(&self) -> usize {
        self.program.len().div_ceil(self.chunk_size)
    }

    /// Index of the next chunk to be produced.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.len()
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Pull up to `n` chunks, advancing the cursor.
    pub fn take_batch(&mut self, n: usize) -> Vec<Chunk> {
        self.by_ref().take(n).collect()
    }
}

impl Iterator for PacketChunker<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.is_exhausted() {
            return None;
        }
        let offset = self.cursor * self.chunk_size;
        let end = (offset + self.chunk_size).min(self.program.len());
        let mut data = self.program[offset..end].to_vec();
        data.resize(self.chunk_size, 0xFF);
        self.cursor += 1;
        Some(Chunk {
            address: (self.start.wrapping_add(offset as u32) & 0xFFFF) as u16,
            data,
        })
    }
}
