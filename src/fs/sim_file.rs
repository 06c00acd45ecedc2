//! Simulated asynchronous files backed by real OS files.
//!
//! The OS file is used only as an opaque byte store; all timing comes
//! from the disk model, and all failures funnel through fault injection
//! or real I/O errors mapped onto [`SimulationError`].

use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use async_trait::async_trait;

use crate::address::UID;
use crate::error::{SimulationError, SimulationResult};
use crate::events::TaskPriority;
use crate::rng::{random_unique_id, sim_random01};
use crate::sim::{SimWorld, WeakSimWorld, dur};

use super::{DiskParameters, OpenFlags, wait_until_disk_ready};

/// The asynchronous file surface exposed to collaborators.
#[async_trait(?Send)]
pub trait AsyncFile {
    /// Read up to `buf.len()` bytes at `offset`. Returns bytes read.
    async fn read(&self, buf: &mut [u8], offset: u64) -> SimulationResult<usize>;

    /// Write all of `data` at `offset`.
    async fn write(&self, data: &[u8], offset: u64) -> SimulationResult<()>;

    /// Truncate or extend the file to `size`.
    async fn truncate(&self, size: u64) -> SimulationResult<()>;

    /// Commit the file. For atomic-create files, the first sync renames
    /// the `.part` file into place.
    async fn sync(&self) -> SimulationResult<()>;

    /// Current file size.
    async fn size(&self) -> SimulationResult<u64>;

    /// The file's current physical name.
    fn filename(&self) -> String;
}

/// A simulated file handle.
pub struct SimFile {
    sim: WeakSimWorld,
    file: File,
    disk: Rc<DiskParameters>,
    filename: String,
    actual_filename: RefCell<String>,
    flags: Cell<OpenFlags>,
    dbgid: UID,
    /// When false, writes and truncates skip the disk-ready wait; a
    /// durability wrapper that issues its own delays would clear this.
    delay_on_write: bool,
    approximate_size: Cell<u64>,
}

impl SimFile {
    /// Open a simulated file on the calling process's machine.
    ///
    /// Runs on the machine process (so the handle survives process
    /// kills), then rebinds to the caller.
    pub(crate) async fn open(
        sim: &SimWorld,
        filename: &str,
        flags: OpenFlags,
        mode: u32,
        disk: Rc<DiskParameters>,
        delay_on_write: bool,
    ) -> SimulationResult<Rc<SimFile>> {
        {
            let mut inner = sim.inner_mut();
            inner.open_count += 1;
            if inner.open_count == 2000 {
                tracing::warn!("too many open files; disabling connection failures");
                inner.speed_up_simulation = true;
                inner.enable_connection_failures = false;
            }
            if inner.open_count >= 3000 {
                tracing::error!("too many open files");
                panic!("too many open files in simulation");
            }
        }

        let caller = sim.current_process();
        sim.on_machine(caller, TaskPriority::DiskWrite).await?;
        let result = Self::open_on_machine(sim, filename, flags, mode, disk, delay_on_write).await;
        sim.on_process(caller, TaskPriority::DiskWrite).await?;
        result.map(Rc::new)
    }

    async fn open_on_machine(
        sim: &SimWorld,
        filename: &str,
        flags: OpenFlags,
        mode: u32,
        disk: Rc<DiskParameters>,
        delay_on_write: bool,
    ) -> SimulationResult<SimFile> {
        let (min_open, max_open) = {
            let inner = sim.inner_mut();
            (inner.knobs.min_open_time, inner.knobs.max_open_time)
        };
        sim.delay(
            dur(min_open + sim_random01() * (max_open - min_open)),
            TaskPriority::DiskWrite,
        )
        .await?;

        let mut physical = filename.to_string();
        if flags.contains(OpenFlags::ATOMIC_WRITE_AND_CREATE) {
            assert!(
                flags.contains(OpenFlags::CREATE)
                    && flags.contains(OpenFlags::READWRITE)
                    && !flags.contains(OpenFlags::EXCLUSIVE),
                "ATOMIC_WRITE_AND_CREATE requires CREATE|READWRITE without EXCLUSIVE"
            );
            physical.push_str(".part");
        }

        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(flags.contains(OpenFlags::READWRITE))
            .create(flags.contains(OpenFlags::CREATE))
            .create_new(flags.contains(OpenFlags::EXCLUSIVE))
            .truncate(flags.contains(OpenFlags::ATOMIC_WRITE_AND_CREATE));
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if mode != 0 {
                options.mode(mode);
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = match options.open(&physical) {
            Ok(file) => file,
            Err(err) => {
                let not_found = err.kind() == std::io::ErrorKind::NotFound;
                tracing::warn!(file = filename, ?flags, %err, "file open error");
                return Err(if not_found {
                    SimulationError::FileNotFound(filename.to_string())
                } else {
                    SimulationError::IoError(err.to_string())
                });
            }
        };
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(SimFile {
            sim: sim.downgrade(),
            file,
            disk,
            filename: filename.to_string(),
            actual_filename: RefCell::new(physical),
            flags: Cell::new(flags),
            dbgid: random_unique_id(),
            delay_on_write,
            approximate_size: Cell::new(size),
        })
    }

    /// Size estimate used by disk-space accounting; tracks the furthest
    /// written offset rather than issuing disk ops.
    pub fn approximate_size(&self) -> u64 {
        self.approximate_size.get()
    }

    /// Debug identifier of this handle.
    pub fn debug_id(&self) -> UID {
        self.dbgid
    }

    /// The logical name this file was opened under.
    pub fn logical_filename(&self) -> String {
        self.filename.clone()
    }

    /// Fault-injection point shared by every operation.
    fn inject(&self, sim: &SimWorld, line: u32, error: SimulationError) -> SimulationResult<()> {
        if sim.should_inject_fault(file!(), line, &error) {
            Err(error)
        } else {
            Ok(())
        }
    }
}

#[async_trait(?Send)]
impl AsyncFile for SimFile {
    async fn read(&self, buf: &mut [u8], offset: u64) -> SimulationResult<usize> {
        let sim = self.sim.upgrade()?;
        wait_until_disk_ready(&sim, &self.disk, buf.len() as u64, false).await?;

        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SimulationError::IoError(e.to_string()))?;
        let n = file
            .read(buf)
            .map_err(|e| SimulationError::IoError(e.to_string()))?;

        self.inject(&sim, line!(), SimulationError::IoError("i/o error".to_string()))?;
        self.inject(&sim, line!(), SimulationError::IoTimeout)?;
        Ok(n)
    }

    async fn write(&self, data: &[u8], offset: u64) -> SimulationResult<()> {
        let sim = self.sim.upgrade()?;
        if self.delay_on_write {
            wait_until_disk_ready(&sim, &self.disk, data.len() as u64, false).await?;
        }

        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SimulationError::IoError(e.to_string()))?;
        file.write_all(data)
            .map_err(|e| SimulationError::IoError(e.to_string()))?;
        let end = offset + data.len() as u64;
        if end > self.approximate_size.get() {
            self.approximate_size.set(end);
        }

        self.inject(&sim, line!(), SimulationError::IoError("i/o error".to_string()))?;
        self.inject(&sim, line!(), SimulationError::IoTimeout)?;
        Ok(())
    }

    async fn truncate(&self, size: u64) -> SimulationResult<()> {
        let sim = self.sim.upgrade()?;
        if self.delay_on_write {
            wait_until_disk_ready(&sim, &self.disk, 0, false).await?;
        }
        self.file
            .set_len(size)
            .map_err(|e| SimulationError::IoError(e.to_string()))?;
        self.approximate_size.set(size);
        self.inject(&sim, line!(), SimulationError::IoError("i/o error".to_string()))?;
        Ok(())
    }

    async fn sync(&self) -> SimulationResult<()> {
        let sim = self.sim.upgrade()?;
        if self.delay_on_write {
            wait_until_disk_ready(&sim, &self.disk, 0, true).await?;
        }

        if self.flags.get().contains(OpenFlags::ATOMIC_WRITE_AND_CREATE) {
            self.flags
                .set(self.flags.get() - OpenFlags::ATOMIC_WRITE_AND_CREATE);
            let part = format!("{}.part", self.filename);

            let mut inner = sim.inner_mut();
            let zone = inner.process(inner.current_process).machine_zone.clone();
            if let Some(machine) = zone.and_then(|z| inner.machines.get_mut(&z)) {
                if let Some(handle) = machine.open_files.remove(&part) {
                    tracing::info!(from = %part, to = %self.filename, "atomic create commit");
                    assert!(
                        !machine.open_files.contains_key(&self.filename),
                        "atomic rename target already open"
                    );
                    std::fs::rename(&part, &self.filename)
                        .map_err(|e| SimulationError::IoError(e.to_string()))?;
                    machine.open_files.insert(self.filename.clone(), handle);
                    *self.actual_filename.borrow_mut() = self.filename.clone();
                }
            }
        }

        self.inject(&sim, line!(), SimulationError::IoError("i/o error".to_string()))?;
        Ok(())
    }

    async fn size(&self) -> SimulationResult<u64> {
        let sim = self.sim.upgrade()?;
        wait_until_disk_ready(&sim, &self.disk, 0, false).await?;
        let mut file = &self.file;
        let pos = file
            .seek(SeekFrom::End(0))
            .map_err(|e| SimulationError::IoError(e.to_string()))?;
        self.inject(&sim, line!(), SimulationError::IoError("i/o error".to_string()))?;
        Ok(pos)
    }

    fn filename(&self) -> String {
        self.actual_filename.borrow().clone()
    }
}

impl std::fmt::Debug for SimFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimFile")
            .field("filename", &self.filename)
            .field("actual", &*self.actual_filename.borrow())
            .field("size", &self.approximate_size.get())
            .finish_non_exhaustive()
    }
}
