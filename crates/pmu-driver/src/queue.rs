//! Ring-buffer queues in falcon DMEM
//!
//! Each queue is a byte ring `[offset, offset + size)` with a head and a tail
//! register. The writer owns the head, the reader owns the tail. Elements are
//! padded to [`QUEUE_ALIGNMENT`](pmu_chip::queue::QUEUE_ALIGNMENT). When a
//! writer runs out of room at the end of the ring it leaves a `REWIND` header
//! and continues at `offset`; a reader that pops a `REWIND` header does the
//! same.
//!
//! Open/close bracket a transaction. The working `position` only reaches the
//! head/tail register on `close(commit = true)`, so an aborted transaction
//! leaves the ring untouched.

use crate::error::{PmuError, Result};
use crate::mutex::MutexArbiter;
use crate::transport::PmuTransport;
use crate::wire::{Header, QueueInfo};
use pmu_chip::queue::{self as qid, align};
use pmu_chip::regs;
use pmu_chip::wire::{unit, HDR_SIZE};

/// Direction a queue is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Consuming from the tail
    Read,
    /// Producing at the head
    Write,
}

/// One DMEM ring.
#[derive(Debug)]
pub struct PmuQueue {
    /// Queue id (`HPQ`, `LPQ`, `SWQ`, `MSGQ`)
    pub id: u32,
    /// Head/tail register index
    pub index: u32,
    /// DMEM start of the ring
    pub offset: u32,
    /// Ring size in bytes
    pub size: u32,
    /// Hardware mutex guarding the ring
    pub mutex_id: u32,
    position: u32,
    oflag: Option<Direction>,
    locked: bool,
    mutex_token: Option<u32>,
}

impl PmuQueue {
    /// Queue `id` with no placement yet. Unusable until [`configure`](Self::configure).
    pub const fn unconfigured(id: u32) -> Self {
        Self {
            id,
            index: 0,
            offset: 0,
            size: 0,
            mutex_id: id,
            position: 0,
            oflag: None,
            locked: false,
            mutex_token: None,
        }
    }

    /// Apply the placement advertised in the INIT message.
    ///
    /// # Errors
    ///
    /// [`PmuError::InvalidCommand`] if a command queue's register index is out
    /// of range.
    pub fn configure(&mut self, info: QueueInfo) -> Result<()> {
        let index = u32::from(info.index);
        if qid::is_command_queue(self.id) && index >= regs::QUEUE_REG_COUNT {
            return Err(PmuError::invalid_command(format!(
                "queue {} register index {index} out of range",
                self.id
            )));
        }
        self.index = index;
        self.offset = info.offset;
        self.size = u32::from(info.size);
        self.position = info.offset;
        self.oflag = None;
        self.locked = false;
        tracing::debug!(
            "queue {}: index {}, offset {:#x}, size {:#x}",
            self.id,
            self.index,
            self.offset,
            self.size
        );
        Ok(())
    }

    /// True once the queue has a placement.
    pub const fn is_configured(&self) -> bool {
        self.size != 0
    }

    /// Direction the queue is currently open in.
    pub const fn open_direction(&self) -> Option<Direction> {
        self.oflag
    }

    /// Working position of the open transaction.
    pub const fn position(&self) -> u32 {
        self.position
    }

    // ── Head / tail ──────────────────────────────────────────────────────────

    const fn head_reg(&self) -> u32 {
        if qid::is_message_queue(self.id) {
            regs::MSGQ_HEAD
        } else {
            regs::queue_head(self.index)
        }
    }

    const fn tail_reg(&self) -> u32 {
        if qid::is_message_queue(self.id) {
            regs::MSGQ_TAIL
        } else {
            regs::queue_tail(self.index)
        }
    }

    /// Current head register.
    pub fn head(&self, io: &dyn PmuTransport) -> u32 {
        io.read_register(self.head_reg()) & regs::QUEUE_ADDR_MASK
    }

    /// Current tail register.
    pub fn tail(&self, io: &dyn PmuTransport) -> u32 {
        io.read_register(self.tail_reg()) & regs::QUEUE_ADDR_MASK
    }

    fn set_head(&self, io: &dyn PmuTransport, head: u32) {
        io.write_register(self.head_reg(), head & regs::QUEUE_ADDR_MASK);
    }

    fn set_tail(&self, io: &dyn PmuTransport, tail: u32) {
        io.write_register(self.tail_reg(), tail & regs::QUEUE_ADDR_MASK);
    }

    // ── Locking ──────────────────────────────────────────────────────────────

    fn lock(&mut self, mutexes: &MutexArbiter) -> Result<()> {
        if qid::is_message_queue(self.id) {
            return Ok(());
        }
        if qid::is_hw_command_queue(self.id) {
            let token = mutexes.acquire(self.mutex_id, self.mutex_token)?;
            self.mutex_token = Some(token);
        }
        // The software queue is guarded by the host lock around this struct.
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self, mutexes: &MutexArbiter) -> Result<()> {
        if qid::is_message_queue(self.id) || !self.locked {
            return Ok(());
        }
        self.locked = false;
        if qid::is_hw_command_queue(self.id) {
            if let Some(token) = self.mutex_token {
                mutexes.release(self.mutex_id, token)?;
            }
        }
        Ok(())
    }

    // ── Open / close ─────────────────────────────────────────────────────────

    /// Whether `size` bytes fit at the head, and whether the writer must
    /// rewind to `offset` first.
    fn has_room(&self, io: &dyn PmuTransport, size: u32) -> (bool, bool) {
        let size = align(size);
        let mut head = self.head(io);
        let tail = self.tail(io);
        let mut rewind = false;
        let mut free = 0;

        if head >= tail {
            free = (self.offset + self.size)
                .saturating_sub(head)
                .saturating_sub(HDR_SIZE);
            if size > free {
                rewind = true;
                head = self.offset;
            }
        }
        if head < tail {
            free = tail - head - 1;
        }
        (size <= free, rewind)
    }

    /// Open for reading at the tail.
    ///
    /// # Errors
    ///
    /// [`PmuError::QueueAlreadyOpen`], or a mutex error for arbitrated queues.
    pub fn open_read(&mut self, io: &dyn PmuTransport, mutexes: &MutexArbiter) -> Result<()> {
        if self.oflag.is_some() {
            return Err(PmuError::QueueAlreadyOpen { queue: self.id });
        }
        self.lock(mutexes)?;
        self.position = self.tail(io);
        self.oflag = Some(Direction::Read);
        Ok(())
    }

    /// Open for writing `size` bytes at the head, rewinding if the element
    /// does not fit before the end of the ring.
    ///
    /// # Errors
    ///
    /// [`PmuError::QueueFull`] if there is no room (retryable),
    /// [`PmuError::QueueAlreadyOpen`], or a mutex error.
    pub fn open_write(
        &mut self,
        io: &dyn PmuTransport,
        mutexes: &MutexArbiter,
        size: u32,
    ) -> Result<()> {
        if self.oflag.is_some() {
            return Err(PmuError::QueueAlreadyOpen { queue: self.id });
        }
        self.lock(mutexes)?;

        let (room, rewind) = self.has_room(io, size);
        if !room {
            tracing::debug!("queue {} full, {size} bytes requested", self.id);
            self.unlock(mutexes)?;
            return Err(PmuError::QueueFull {
                queue: self.id,
                size,
            });
        }

        self.position = self.head(io);
        self.oflag = Some(Direction::Write);
        if rewind {
            if let Err(e) = self.rewind(io) {
                self.oflag = None;
                self.unlock(mutexes)?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Finish the transaction. With `commit` the position is published to
    /// the tail (reader) or head (writer); the lock is released either way.
    ///
    /// # Errors
    ///
    /// [`PmuError::QueueNotOpen`], or a mutex release error.
    pub fn close(
        &mut self,
        io: &dyn PmuTransport,
        mutexes: &MutexArbiter,
        commit: bool,
    ) -> Result<()> {
        let dir = self.oflag.take().ok_or(PmuError::QueueNotOpen {
            queue: self.id,
            op: "close",
        })?;
        if commit {
            match dir {
                Direction::Read => self.set_tail(io, self.position),
                Direction::Write => self.set_head(io, self.position),
            }
        }
        self.unlock(mutexes)
    }

    // ── Data ─────────────────────────────────────────────────────────────────

    /// Copy `data` in at the working position.
    ///
    /// # Errors
    ///
    /// [`PmuError::QueueNotOpen`] unless open for writing, or a DMEM error.
    #[allow(clippy::cast_possible_truncation)]
    pub fn push(&mut self, io: &dyn PmuTransport, data: &[u8]) -> Result<()> {
        if self.oflag != Some(Direction::Write) {
            tracing::error!("queue {}: push while not open for write", self.id);
            return Err(PmuError::QueueNotOpen {
                queue: self.id,
                op: "write",
            });
        }
        io.copy_in(self.position, data)?;
        self.position += align(data.len() as u32);
        Ok(())
    }

    /// Copy up to `buf.len()` bytes out from the working position. A request
    /// larger than what lies between the position and the head (or the end
    /// of the ring) is clamped with a warning. Returns the bytes read.
    ///
    /// # Errors
    ///
    /// [`PmuError::QueueNotOpen`] unless open for reading, or a DMEM error.
    #[allow(clippy::cast_possible_truncation)]
    pub fn pop(&mut self, io: &dyn PmuTransport, buf: &mut [u8]) -> Result<usize> {
        if self.oflag != Some(Direction::Read) {
            tracing::error!("queue {}: pop while not open for read", self.id);
            return Err(PmuError::QueueNotOpen {
                queue: self.id,
                op: "read",
            });
        }

        let head = self.head(io);
        let tail = self.position;
        let used = if head > tail {
            head - tail
        } else {
            (self.offset + self.size).saturating_sub(tail)
        };

        let mut size = buf.len() as u32;
        if size > used {
            tracing::warn!("queue {}: requested {size} bytes, only {used} available", self.id);
            size = used;
        }

        io.copy_out(tail, &mut buf[..size as usize])?;
        self.position += align(size);
        Ok(size as usize)
    }

    /// Reset the working position to the start of the ring. A writer first
    /// leaves a `REWIND` marker at the current position.
    ///
    /// # Errors
    ///
    /// [`PmuError::QueueNotOpen`], or a DMEM error writing the marker.
    #[allow(clippy::cast_possible_truncation)]
    pub fn rewind(&mut self, io: &dyn PmuTransport) -> Result<()> {
        match self.oflag {
            None => {
                return Err(PmuError::QueueNotOpen {
                    queue: self.id,
                    op: "rewind",
                })
            }
            Some(Direction::Write) => {
                let marker = Header {
                    unit_id: unit::REWIND,
                    size: HDR_SIZE as u16,
                    ctrl_flags: 0,
                    seq_id: 0,
                };
                self.push(io, &marker.encode())?;
                tracing::debug!("queue {} rewinded", self.id);
            }
            Some(Direction::Read) => {}
        }
        self.position = self.offset;
        Ok(())
    }

    /// True if there is nothing between the reader's position and the head.
    pub fn is_empty(&self, io: &dyn PmuTransport) -> bool {
        let head = self.head(io);
        let tail = if self.oflag == Some(Direction::Read) {
            self.position
        } else {
            self.tail(io)
        };
        head == tail
    }
}
