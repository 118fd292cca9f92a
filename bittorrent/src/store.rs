use std::{
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};
use sha1::{Digest, Sha1};
use crate::{Bitfield, ID};

// Completed pieces kept around for the upload path.
const READ_CACHE_PIECES: usize = 64;

pub type Result<T> = std::result::Result<T, StoreError>;

type PieceCallback = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {

    #[error("piece index {0} out of range")]
    PieceOutOfRange(usize),

    #[error("block range out of piece bounds")]
    BlockOutOfRange,

    // Distinguished so the scheduler can reset the piece and re-request.
    #[error("piece {0} failed hash verification")]
    HashMismatch(usize),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("sync error: {0}")]
    SyncError(String),

}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        StoreError::SyncError(e.to_string())
    }
}

// File-backed block storage for a single-file torrent. The backing file's
// byte layout is identical to the assembled content; a piece is complete only
// once every block has been written and the on-disk bytes hash to the
// expected SHA-1.
pub struct PieceStore {

    path: PathBuf,

    piece_len: usize,

    total_len: u64,

    num_pieces: usize,

    file: File,

    state: RwLock<State>,

    read_cache: Mutex<lru::LruCache<usize, Arc<Vec<u8>>>>,

    callbacks: RwLock<Vec<PieceCallback>>,

}

struct State {

    // Exactly the set of complete pieces.
    bitfield: Bitfield,

    // Bytes accumulated per piece; zeroed again on hash mismatch.
    received: Vec<u64>,

    // One 20-byte digest per piece. None disables verification and any fully
    // written piece is accepted.
    expected: Option<Vec<ID>>,

}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("path", &self.path)
            .field("piece_len", &self.piece_len)
            .field("total_len", &self.total_len)
            .field("num_pieces", &self.num_pieces)
            .finish()
    }
}

impl PieceStore {

    // Download mode: creates the file and truncates it to the total length.
    pub fn create<P: AsRef<Path>>(path: P, piece_len: usize, total_len: u64) -> Result<Self> {
        Self::open(path, piece_len, total_len, true)
    }

    // Seed/resume mode: opens a pre-existing file without truncation.
    pub fn open_existing<P: AsRef<Path>>(path: P, piece_len: usize, total_len: u64) -> Result<Self> {
        Self::open(path, piece_len, total_len, false)
    }

    fn open<P: AsRef<Path>>(path: P, piece_len: usize, total_len: u64, truncate: bool) -> Result<Self> {

        assert!(piece_len > 0 && total_len > 0, "invalid store geometry");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if truncate {
            file.set_len(total_len)?;
        }

        let num_pieces = ((total_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            piece_len,
            total_len,
            num_pieces,
            file,
            state: RwLock::new(State {
                bitfield: Bitfield::repeat(false, num_pieces),
                received: vec![0; num_pieces],
                expected: None,
            }),
            // Unwrap safe because value is always > 0.
            read_cache: Mutex::new(lru::LruCache::new(NonZeroUsize::new(READ_CACHE_PIECES).unwrap())),
            callbacks: RwLock::new(Vec::new()),
        })
    }

    pub fn num_pieces(&self) -> usize { self.num_pieces }

    pub fn piece_length(&self) -> usize { self.piece_len }

    pub fn total_length(&self) -> u64 { self.total_len }

    pub fn path(&self) -> &Path { &self.path }

    // Length of a given piece; the last one is usually shorter.
    pub fn piece_size(&self, piece: usize) -> usize {
        if piece == self.num_pieces - 1 {
            (self.total_len - self.piece_len as u64 * (self.num_pieces as u64 - 1)) as usize
        } else {
            self.piece_len
        }
    }

    pub fn bitfield(&self) -> Bitfield {
        self.state.read().expect("store lock poisoned").bitfield.clone()
    }

    pub fn has_piece(&self, piece: usize) -> bool {
        if piece >= self.num_pieces {
            return false;
        }
        self.state.read().expect("store lock poisoned").bitfield[piece]
    }

    pub fn all_complete(&self) -> bool {
        self.state.read().expect("store lock poisoned").bitfield.all()
    }

    // Bytes still missing, for announce `left`.
    pub fn bytes_left(&self) -> u64 {
        let state = self.state.read().expect("store lock poisoned");
        let mut have = 0u64;
        for piece in state.bitfield.iter_ones() {
            have += self.piece_size(piece) as u64;
        }
        self.total_len - have.min(self.total_len)
    }

    pub fn set_expected_hashes(&self, hashes: Vec<ID>) {
        debug_assert_eq!(hashes.len(), self.num_pieces);
        self.state.write().expect("store lock poisoned").expected = Some(hashes);
    }

    // Registered callbacks fire on a background thread after the piece's bit
    // is set and the file flushed.
    pub fn on_piece_complete<F: Fn(usize) + Send + Sync + 'static>(&self, callback: F) {
        self.callbacks.write().expect("store lock poisoned").push(Arc::new(callback));
    }

    // Writes a block and returns whether it completed (and verified) its
    // piece. On hash mismatch the piece's received-byte counter is zeroed, the
    // bitfield bit stays clear and a distinguished error is returned.
    pub fn write_block(&self, piece: usize, begin: usize, data: &[u8]) -> Result<bool> {

        if piece >= self.num_pieces {
            return Err(StoreError::PieceOutOfRange(piece));
        }
        let psize = self.piece_size(piece);
        let end = begin.checked_add(data.len()).ok_or(StoreError::BlockOutOfRange)?;
        if end > psize {
            return Err(StoreError::BlockOutOfRange);
        }

        let mut state = self.state.write()?;
        if state.bitfield[piece] {
            // Piece already verified, nothing to do.
            return Ok(false);
        }

        let offset = piece as u64 * self.piece_len as u64 + begin as u64;
        self.file.write_all_at(data, offset)?;
        state.received[piece] += data.len() as u64;

        if state.received[piece] < psize as u64 {
            return Ok(false);
        }

        // All bytes in: verify against the on-disk content.
        if let Some(expected) = state.expected.as_ref().map(|h| h[piece]) {
            let on_disk = self.read_piece(piece, psize)?;
            let mut hasher = Sha1::new();
            hasher.update(&on_disk);
            if hasher.finalize().as_slice() != expected {
                state.received[piece] = 0;
                return Err(StoreError::HashMismatch(piece));
            }
        }

        state.bitfield.set(piece, true);
        self.file.sync_data()?;
        drop(state);

        self.fire_piece_complete(piece);
        Ok(true)
    }

    // Read a block for the upload path, through a small LRU of whole pieces.
    pub fn read_block(&self, piece: usize, begin: usize, length: usize) -> Result<Vec<u8>> {

        if piece >= self.num_pieces {
            return Err(StoreError::PieceOutOfRange(piece));
        }
        let psize = self.piece_size(piece);
        let end = begin.checked_add(length).ok_or(StoreError::BlockOutOfRange)?;
        if end > psize {
            return Err(StoreError::BlockOutOfRange);
        }

        let complete = self.has_piece(piece);
        if complete {
            if let Some(cached) = self.read_cache.lock()?.get(&piece) {
                return Ok(cached[begin..end].to_vec());
            }
        }

        let buf = {
            let _state = self.state.read()?;
            self.read_piece(piece, psize)?
        };
        let block = buf[begin..end].to_vec();
        if complete {
            self.read_cache.lock()?.put(piece, Arc::new(buf));
        }
        Ok(block)
    }

    // Startup resume: hash every piece of the pre-existing file and mark the
    // ones matching their expected digest. Returns how many were marked.
    pub fn scan_and_mark_complete(&self) -> Result<usize> {

        let mut state = self.state.write()?;
        let expected = match state.expected.clone() {
            Some(expected) => expected,
            None => return Ok(0),
        };

        let mut marked = 0;
        for piece in 0..self.num_pieces {
            let psize = self.piece_size(piece);
            let on_disk = self.read_piece(piece, psize)?;
            let mut hasher = Sha1::new();
            hasher.update(&on_disk);
            if hasher.finalize().as_slice() == expected[piece] {
                state.bitfield.set(piece, true);
                state.received[piece] = psize as u64;
                marked += 1;
            }
        }
        tracing::info!("resume scan marked {}/{} pieces complete", marked, self.num_pieces);
        Ok(marked)
    }

    fn read_piece(&self, piece: usize, psize: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; psize];
        self.file.read_exact_at(&mut buf, piece as u64 * self.piece_len as u64)?;
        Ok(buf)
    }

    fn fire_piece_complete(&self, piece: usize) {
        let callbacks = self.callbacks.read().expect("store lock poisoned").clone();
        if callbacks.is_empty() {
            return;
        }
        // User code runs off-lock on its own thread.
        std::thread::spawn(move || {
            for callback in callbacks {
                callback(piece);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    fn sha1_of(data: &[u8]) -> ID {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn temp_store(piece_len: usize, total_len: u64) -> (tempfile::TempDir, PieceStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PieceStore::create(dir.path().join("data.part"), piece_len, total_len).unwrap();
        (dir, store)
    }

    #[test]
    fn test_geometry() {
        let (_dir, store) = temp_store(16384, 12345);
        assert_eq!(store.num_pieces(), 1);
        assert_eq!(store.piece_size(0), 12345);

        let (_dir, store) = temp_store(16384, 16384 * 2 + 100);
        assert_eq!(store.num_pieces(), 3);
        assert_eq!(store.piece_size(0), 16384);
        assert_eq!(store.piece_size(2), 100);
    }

    #[test]
    fn test_write_verify_complete() {
        let (_dir, store) = temp_store(16384, 12345);
        store.set_expected_hashes(vec![sha1_of(&vec![0u8; 12345])]);

        let completed = store.write_block(0, 0, &vec![0u8; 12345]).unwrap();
        assert!(completed);
        assert!(store.has_piece(0));
        assert!(store.all_complete());
        assert_eq!(store.bytes_left(), 0);
    }

    #[test]
    fn test_hash_mismatch_resets_counter() {
        let (_dir, store) = temp_store(16384, 12345);
        store.set_expected_hashes(vec![sha1_of(&vec![0u8; 12345])]);

        // Corrupt first byte.
        let mut bad = vec![0u8; 12345];
        bad[0] = 1;
        match store.write_block(0, 0, &bad) {
            Err(StoreError::HashMismatch(0)) => {},
            other => panic!("expected hash mismatch, got {:?}", other.map(|_| ())),
        }
        assert!(!store.has_piece(0));

        // Counter was zeroed; an honest rewrite completes the piece.
        let completed = store.write_block(0, 0, &vec![0u8; 12345]).unwrap();
        assert!(completed);
        assert!(store.has_piece(0));
    }

    #[test]
    fn test_multi_block_piece() {
        let total = (BLOCK_SIZE * 2 + 100) as u64;
        let (_dir, store) = temp_store(BLOCK_SIZE * 3, total);
        let content: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        store.set_expected_hashes(vec![sha1_of(&content)]);

        assert!(!store.write_block(0, 0, &content[..BLOCK_SIZE]).unwrap());
        assert!(!store.write_block(0, BLOCK_SIZE, &content[BLOCK_SIZE..BLOCK_SIZE * 2]).unwrap());
        let done = store.write_block(0, BLOCK_SIZE * 2, &content[BLOCK_SIZE * 2..]).unwrap();
        assert!(done);

        // Upload path round trip.
        let read = store.read_block(0, BLOCK_SIZE, BLOCK_SIZE).unwrap();
        assert_eq!(read, &content[BLOCK_SIZE..BLOCK_SIZE * 2]);
        // Second read served from cache.
        let read = store.read_block(0, 0, 10).unwrap();
        assert_eq!(read, &content[..10]);
    }

    #[test]
    fn test_range_errors() {
        let (_dir, store) = temp_store(16384, 12345);
        assert!(matches!(store.write_block(1, 0, &[0]), Err(StoreError::PieceOutOfRange(1))));
        assert!(matches!(store.write_block(0, 12345, &[0]), Err(StoreError::BlockOutOfRange)));
        assert!(matches!(store.read_block(0, 0, 12346), Err(StoreError::BlockOutOfRange)));
    }

    #[test]
    fn test_scan_and_mark_complete() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        let content: Vec<u8> = (0..40000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let store = PieceStore::open_existing(&path, 16384, content.len() as u64).unwrap();
        let hashes = vec![
            sha1_of(&content[..16384]),
            // Wrong digest for the middle piece.
            [0xab; 20],
            sha1_of(&content[32768..]),
        ];
        store.set_expected_hashes(hashes);
        let marked = store.scan_and_mark_complete().unwrap();
        assert_eq!(marked, 2);
        assert!(store.has_piece(0));
        assert!(!store.has_piece(1));
        assert!(store.has_piece(2));
    }

    #[test]
    fn test_completion_callback_fires() {
        let (_dir, store) = temp_store(16384, 100);
        store.set_expected_hashes(vec![sha1_of(&vec![7u8; 100])]);

        let (tx, rx) = std::sync::mpsc::channel();
        store.on_piece_complete(move |piece| { tx.send(piece).ok(); });

        store.write_block(0, 0, &vec![7u8; 100]).unwrap();
        let piece = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(piece, 0);
    }
}
