//! # Memory-Mapped Block Device
//!
//! Fixed-size block access over a memory-mapped file. Every tree node and
//! data extent occupies exactly one block; block 0 is reserved for the
//! superblock.
//!
//! ## Design
//!
//! The file is mapped with `memmap2` and grown by remapping. Unlike a
//! borrow-checked single-owner mapping, the device hands out *copies* of
//! block contents: callers decode blocks into in-memory node structures, so
//! zero-copy access buys nothing here and copying keeps the mapping free to
//! be remapped on grow. Interior state (mapping + block count) sits behind a
//! `parking_lot::RwLock` so reads take a shared lock and writes/grows take
//! an exclusive one.
//!
//! ## File Format
//!
//! ```text
//! Offset 0:              Block 0 (superblock)
//! Offset block_size:     Block 1
//! Offset 2*block_size:   Block 2
//! ...
//! ```
//!
//! The file size is always a multiple of the block size.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;

struct Mapping {
    file: File,
    mmap: MmapMut,
    block_count: u64,
}

pub struct BlockDevice {
    block_size: usize,
    state: RwLock<Mapping>,
}

impl BlockDevice {
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, initial_blocks: u64) -> Result<Self> {
        let path = path.as_ref();
        ensure!(block_size > 0, "block size must be non-zero");
        ensure!(initial_blocks > 0, "initial block count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        let file_size = initial_blocks * block_size as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), file_size))?;

        // SAFETY: the file was just created with exclusive access and sized
        // to a block multiple. The mapping's lifetime is tied to this
        // device, and all access is bounds-checked against block_count.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            block_size,
            state: RwLock::new(Mapping {
                file,
                mmap,
                block_count: initial_blocks,
            }),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        ensure!(block_size > 0, "block size must be non-zero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0 && file_size % block_size as u64 == 0,
            "store file '{}' size {} is not a multiple of block size {}",
            path.display(),
            file_size,
            block_size
        );

        // SAFETY: the file is opened read+write for exclusive use by this
        // process; the mapping's lifetime is tied to this device and all
        // access is bounds-checked against block_count.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            block_size,
            state: RwLock::new(Mapping {
                file,
                mmap,
                block_count: file_size / block_size as u64,
            }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.state.read().block_count
    }

    /// Copies the contents of `block` into `buf`, which must be exactly one
    /// block long.
    pub fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.block_size,
            "read buffer is {} bytes, block size is {}",
            buf.len(),
            self.block_size
        );

        let state = self.state.read();
        ensure!(
            block < state.block_count,
            "block {} out of bounds (block_count={})",
            block,
            state.block_count
        );

        let offset = block as usize * self.block_size;
        buf.copy_from_slice(&state.mmap[offset..offset + self.block_size]);
        Ok(())
    }

    /// Writes one block, growing the file if `block` lies past the end.
    pub fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == self.block_size,
            "write buffer is {} bytes, block size is {}",
            data.len(),
            self.block_size
        );

        let mut state = self.state.write();
        if block >= state.block_count {
            grow(&mut state, self.block_size, block + 1)?;
        }

        let offset = block as usize * self.block_size;
        state.mmap[offset..offset + self.block_size].copy_from_slice(data);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.state
            .read()
            .mmap
            .flush()
            .wrap_err("failed to sync store file")
    }
}

fn grow(state: &mut Mapping, block_size: usize, min_blocks: u64) -> Result<()> {
    // Grow geometrically to amortize remaps.
    let new_count = min_blocks.max(state.block_count * 2);

    state
        .mmap
        .flush()
        .wrap_err("failed to flush mapping before grow")?;

    let new_size = new_count * block_size as u64;
    state
        .file
        .set_len(new_size)
        .wrap_err_with(|| format!("failed to extend store file to {} bytes", new_size))?;

    // SAFETY: the exclusive write lock guarantees no outstanding reads of
    // the old mapping; the file has been extended to new_size; the old
    // mapping is dropped on assignment.
    state.mmap = unsafe {
        MmapMut::map_mut(&state.file).wrap_err("failed to remap store file after grow")?
    };
    state.block_count = new_count;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BLOCK: usize = 256;

    fn create_device(blocks: u64) -> (tempfile::TempDir, BlockDevice) {
        let dir = tempdir().unwrap();
        let dev = BlockDevice::create(dir.path().join("store.bin"), BLOCK, blocks).unwrap();
        (dir, dev)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, dev) = create_device(4);

        let data = vec![0xA5u8; BLOCK];
        dev.write_block(2, &data).unwrap();

        let mut out = vec![0u8; BLOCK];
        dev.read_block(2, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn read_out_of_bounds_fails() {
        let (_dir, dev) = create_device(2);

        let mut out = vec![0u8; BLOCK];
        let err = dev.read_block(10, &mut out).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn write_past_end_grows() {
        let (_dir, dev) = create_device(2);

        let data = vec![7u8; BLOCK];
        dev.write_block(9, &data).unwrap();
        assert!(dev.block_count() >= 10);

        let mut out = vec![0u8; BLOCK];
        dev.read_block(9, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");

        let data = vec![0x42u8; BLOCK];
        {
            let dev = BlockDevice::create(&path, BLOCK, 4).unwrap();
            dev.write_block(1, &data).unwrap();
            dev.sync().unwrap();
        }

        let dev = BlockDevice::open(&path, BLOCK).unwrap();
        let mut out = vec![0u8; BLOCK];
        dev.read_block(1, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn wrong_buffer_size_rejected() {
        let (_dir, dev) = create_device(2);

        let mut small = vec![0u8; BLOCK - 1];
        assert!(dev.read_block(0, &mut small).is_err());
        assert!(dev.write_block(0, &small).is_err());
    }
}
