//! Shared in-memory target for integration tests

#![allow(dead_code)]

use flashkit_core::{Error, Result, Target, TargetOpener};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Failure injected into the in-memory target
#[derive(Debug, Clone, Copy, Default)]
pub enum Fault {
    #[default]
    None,
    /// `open_write` fails
    Open,
    /// The n-th write call (0-based) returns an error
    WriteError(usize),
    /// Reads return this byte instead of what was written
    CorruptReads(u8),
}

/// State shared between an opener, its targets and the test
#[derive(Default)]
pub struct MemDisk {
    pub data: Mutex<Vec<u8>>,
    pub writes: Mutex<Vec<(u64, usize)>>,
    pub opens: AtomicUsize,
    pub closed: AtomicBool,
    pub fault: Mutex<Fault>,
}

impl MemDisk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_fault(fault: Fault) -> Arc<Self> {
        let disk = Self::new();
        *disk.fault.lock().unwrap() = fault;
        disk
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> Vec<(u64, usize)> {
        self.writes.lock().unwrap().clone()
    }

    fn fault(&self) -> Fault {
        *self.fault.lock().unwrap()
    }
}

pub struct MemTarget {
    disk: Arc<MemDisk>,
}

impl Target for MemTarget {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let mut writes = self.disk.writes.lock().unwrap();
        if let Fault::WriteError(n) = self.disk.fault() {
            if writes.len() == n {
                return Err(io::Error::other("device went away"));
            }
        }
        writes.push((offset, data.len()));

        let mut buf = self.disk.data.lock().unwrap();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        let buf = self.disk.data.lock().unwrap();
        let start = (offset as usize).min(buf.len());
        let n = buffer.len().min(buf.len() - start);
        buffer[..n].copy_from_slice(&buf[start..start + n]);
        if let Fault::CorruptReads(byte) = self.disk.fault() {
            buffer[..n].fill(byte);
        }
        Ok(n)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.disk.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`MemTarget`]s over one shared [`MemDisk`]
pub struct MemOpener {
    pub disk: Arc<MemDisk>,
}

impl MemOpener {
    pub fn new(disk: &Arc<MemDisk>) -> Arc<Self> {
        Arc::new(Self {
            disk: Arc::clone(disk),
        })
    }
}

impl TargetOpener for MemOpener {
    fn path(&self) -> &str {
        "mem://disk"
    }

    fn open_write(&self) -> Result<Box<dyn Target>> {
        self.disk.opens.fetch_add(1, Ordering::SeqCst);
        if let Fault::Open = self.disk.fault() {
            return Err(Error::Open {
                path: self.path().to_string(),
                message: "no medium".to_string(),
            });
        }
        Ok(Box::new(MemTarget {
            disk: Arc::clone(&self.disk),
        }))
    }

    fn open_read(&self) -> Result<Box<dyn Target>> {
        Ok(Box::new(MemTarget {
            disk: Arc::clone(&self.disk),
        }))
    }
}

/// Deterministic non-zero test pattern
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}
